use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, TimeZone, Utc};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::Notify;
use tower::ServiceExt;

use leadfunnel_core::analytics::{EventSource, FetchRequest};
use leadfunnel_core::event::{EventAttributes, TrackingEvent};
use leadfunnel_duckdb::DuckDbEventStore;
use leadfunnel_server::app::build_app;
use leadfunnel_server::config::Config;
use leadfunnel_server::state::AppState;

const WINDOW: &str = "start_date=2024-03-01&end_date=2024-03-03";

fn setup(config: Config) -> (Arc<AppState>, axum::Router) {
    let db = DuckDbEventStore::open_in_memory().expect("in-memory DuckDB");
    let state = Arc::new(AppState::new(db, config));
    let app = build_app(Arc::clone(&state));
    (state, app)
}

/// A source whose fetch never completes. Records when it starts and when the
/// pending fetch is dropped by the engine.
#[derive(Default)]
struct StalledSource {
    started: Notify,
    abandoned: Arc<AtomicBool>,
}

struct MarkOnDrop(Arc<AtomicBool>);

impl Drop for MarkOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl EventSource for StalledSource {
    async fn fetch_events(&self, _request: &FetchRequest) -> anyhow::Result<Vec<TrackingEvent>> {
        let _mark = MarkOnDrop(Arc::clone(&self.abandoned));
        self.started.notify_one();
        std::future::pending::<()>().await;
        Ok(Vec::new())
    }
}

fn setup_stalled(config: Config) -> (Arc<StalledSource>, Arc<AppState>, axum::Router) {
    let db = Arc::new(DuckDbEventStore::open_in_memory().expect("in-memory DuckDB"));
    let source = Arc::new(StalledSource::default());
    let state = Arc::new(AppState::with_source(db, source.clone(), config));
    let app = build_app(Arc::clone(&state));
    (source, state, app)
}

async fn json_body(response: axum::http::Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("parse JSON")
}

async fn get(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build request");
    let response = app.clone().oneshot(request).await.expect("request");
    let status = response.status();
    (status, json_body(response).await)
}

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0)
        .single()
        .expect("valid timestamp")
}

fn event(
    event_type: &str,
    actor: &str,
    occurred_at: DateTime<Utc>,
    source: Option<&str>,
    attrs: &[(&str, &str)],
) -> TrackingEvent {
    let attributes: EventAttributes = attrs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    TrackingEvent {
        id: uuid::Uuid::new_v4().to_string(),
        event_type: event_type.to_string(),
        actor_id: Some(actor.to_string()),
        session_id: format!("sess-{actor}"),
        occurred_at,
        attributes,
        utm_source: source.map(str::to_string),
        utm_medium: None,
        utm_campaign: source.map(|_| "spring24".to_string()),
    }
}

/// Two actors land, one of them (from Meta) completes a lead.
async fn seed(state: &AppState) {
    state
        .db
        .insert_events(&[
            event(
                "page-view",
                "a",
                at(1, 10),
                Some("facebook"),
                &[("page_path", "/financiamientos"), ("fbclid", "x1")],
            ),
            event("registration-complete", "a", at(1, 11), Some("facebook"), &[]),
            event("lead-complete", "a", at(2, 9), Some("facebook"), &[]),
            event("page-view", "b", at(2, 12), None, &[("page_path", "/autos")]),
        ])
        .await
        .expect("seed events");
}

// ============================================================
// BDD: Funnel endpoint returns every stage and breakdown
// ============================================================
#[tokio::test]
async fn test_funnel_returns_stages_and_breakdowns() {
    let (state, app) = setup(Config::default());
    seed(&state).await;

    let (status, json) = get(&app, &format!("/api/funnel?{WINDOW}")).await;
    assert_eq!(status, StatusCode::OK);

    let data = &json["data"];
    assert_eq!(data["total_events"], 4);
    assert_eq!(data["total_actors"], 2);
    assert_eq!(data["timezone"], "UTC");

    let stages = data["funnel"]["stages"].as_array().expect("stages");
    assert_eq!(stages.len(), 6);
    assert_eq!(stages[0]["stage"], "landing_view");
    assert_eq!(stages[0]["actors"], 2);
    assert_eq!(stages[0]["percent_of_first"], 100.0);
    assert_eq!(stages[5]["stage"], "lead_complete");
    assert_eq!(stages[5]["actors"], 1);
    assert_eq!(data["funnel"]["overall_rate"], 50.0);
    assert_eq!(data["funnel"]["gating"], "independent");

    assert_eq!(data["timeseries"].as_array().expect("timeseries").len(), 3);
    assert_eq!(data["campaigns"][0]["campaign"], "spring24");
    let channels = data["channel_funnels"].as_array().expect("channels");
    assert_eq!(channels.len(), 2);
    assert_eq!(channels[0]["channel"], "meta");
    assert_eq!(channels[0]["channel_actors"], 1);
}

// ============================================================
// BDD: Source filter narrows the slice
// ============================================================
#[tokio::test]
async fn test_funnel_filters_by_utm_source() {
    let (state, app) = setup(Config::default());
    seed(&state).await;

    let (status, json) = get(&app, &format!("/api/funnel?{WINDOW}&utm_source=facebook")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["total_events"], 3);
    assert_eq!(json["data"]["total_actors"], 1);
    assert_eq!(json["data"]["filter"]["utm_source"], "facebook");
}

// ============================================================
// BDD: Sequential gating is opt-in and echoed back
// ============================================================
#[tokio::test]
async fn test_funnel_sequential_gating() {
    let (state, app) = setup(Config::default());
    seed(&state).await;

    let (status, json) = get(&app, &format!("/api/funnel?{WINDOW}&gating=sequential")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["funnel"]["gating"], "sequential");
    // Actor a skipped the three middle stages, so nothing survives the gate.
    assert_eq!(json["data"]["funnel"]["stages"][5]["actors"], 0);
}

// ============================================================
// BDD: Validation failures are 400 validation_error
// ============================================================
#[tokio::test]
async fn test_funnel_rejects_invalid_input() {
    let (_state, app) = setup(Config::default());

    for uri in [
        "/api/funnel?start_date=2024-13-01&end_date=2024-03-03",
        "/api/funnel?start_date=2024-03-05&end_date=2024-03-01",
        "/api/funnel?start_date=2022-01-01&end_date=2024-03-01",
        "/api/funnel?start_date=2024-03-01&end_date=2024-03-03&gating=strict",
    ] {
        let (status, json) = get(&app, uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(json["error"]["code"], "validation_error", "{uri}");
    }

    let (status, json) = get(&app, &format!("/api/funnel?{WINDOW}&timezone=Mars/Olympus")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "validation_error");
    assert_eq!(json["error"]["field"], "timezone");
}

// ============================================================
// BDD: Empty store still yields a fully populated response
// ============================================================
#[tokio::test]
async fn test_funnel_on_empty_store() {
    let (_state, app) = setup(Config::default());
    let (status, json) = get(&app, &format!("/api/funnel?{WINDOW}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["total_events"], 0);
    assert_eq!(json["data"]["funnel"]["overall_rate"], 0.0);
    assert_eq!(json["data"]["funnel"]["stages"].as_array().expect("stages").len(), 6);
    assert_eq!(json["data"]["timeseries"].as_array().expect("timeseries").len(), 3);
}

// ============================================================
// BDD: Results are cached per query until the TTL lapses
// ============================================================
#[tokio::test]
async fn test_funnel_results_are_cached() {
    let (state, app) = setup(Config::default());
    seed(&state).await;
    let uri = format!("/api/funnel?{WINDOW}");

    let (_, first) = get(&app, &uri).await;
    state
        .db
        .insert_events(&[event("page-view", "c", at(3, 8), None, &[])])
        .await
        .expect("late event");
    let (_, second) = get(&app, &uri).await;
    assert_eq!(first, second);

    // Explicit default timezone is the same normalised query.
    let (_, explicit) = get(&app, &format!("{uri}&timezone=UTC")).await;
    assert_eq!(first, explicit);

    // A different filter is a different entry.
    let (_, filtered) = get(&app, &format!("{uri}&utm_source=facebook")).await;
    assert_eq!(filtered["data"]["total_events"], 3);
}

#[tokio::test]
async fn test_funnel_cache_disabled_with_zero_ttl() {
    let config = Config {
        cache_ttl_secs: 0,
        ..Config::default()
    };
    let (state, app) = setup(config);
    seed(&state).await;
    let uri = format!("/api/funnel?{WINDOW}");

    let (_, first) = get(&app, &uri).await;
    assert_eq!(first["data"]["total_events"], 4);
    state
        .db
        .insert_events(&[event("page-view", "c", at(3, 8), None, &[])])
        .await
        .expect("late event");
    let (_, second) = get(&app, &uri).await;
    assert_eq!(second["data"]["total_events"], 5);
}

// ============================================================
// BDD: Store failures are 502 and never cached
// ============================================================
#[tokio::test]
async fn test_funnel_store_failure_is_502_and_not_cached() {
    let (state, app) = setup(Config::default());
    seed(&state).await;
    {
        let conn = state.db.conn_for_test().await;
        conn.execute(
            "INSERT INTO tracking_events (id, event_type, session_id, occurred_at, attributes)
             VALUES ('corrupt', 'page-view', 's', '2024-03-02 08:00:00', 'not json')",
            [],
        )
        .expect("insert corrupt row");
    }
    let uri = format!("/api/funnel?{WINDOW}");

    let (status, json) = get(&app, &uri).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["error"]["code"], "event_store_unavailable");

    {
        let conn = state.db.conn_for_test().await;
        conn.execute("DELETE FROM tracking_events WHERE id = 'corrupt'", [])
            .expect("remove corrupt row");
    }
    let (status, json) = get(&app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["total_events"], 4);
}

// ============================================================
// BDD: Reporting timezone shifts day buckets
// ============================================================
#[tokio::test]
async fn test_funnel_honours_reporting_timezone() {
    let (state, app) = setup(Config::default());
    state
        .db
        .insert_events(&[event("page-view", "late", at(2, 3), None, &[])])
        .await
        .expect("seed");

    // 03:00 UTC on the 2nd is 21:00 on the 1st in Mexico City.
    let (status, json) = get(
        &app,
        "/api/funnel?start_date=2024-03-01&end_date=2024-03-01&timezone=America/Mexico_City",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["total_events"], 1);
    assert_eq!(json["data"]["timeseries"][0]["date"], "2024-03-01");
    assert_eq!(json["data"]["timezone"], "America/Mexico_City");
}

// ============================================================
// BDD: Store timeouts are 504 event_store_timeout
// ============================================================
#[tokio::test]
async fn test_funnel_store_timeout_is_504() {
    let config = Config {
        fetch_timeout_ms: 50,
        ..Config::default()
    };
    let (source, state, app) = setup_stalled(config);

    let (status, json) = get(&app, &format!("/api/funnel?{WINDOW}")).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(json["error"]["code"], "event_store_timeout");
    assert!(source.abandoned.load(Ordering::SeqCst));
    assert_eq!(state.cached_funnel_count().await, 0);
}

// ============================================================
// BDD: A client disconnect abandons the in-flight fetch
// ============================================================
#[tokio::test]
async fn test_client_disconnect_abandons_fetch() {
    let config = Config {
        fetch_timeout_ms: 60_000,
        ..Config::default()
    };
    let (source, state, app) = setup_stalled(config);

    let request = Request::builder()
        .method("GET")
        .uri(format!("/api/funnel?{WINDOW}"))
        .body(Body::empty())
        .expect("build request");
    let in_flight = tokio::spawn(app.oneshot(request));

    tokio::time::timeout(Duration::from_secs(5), source.started.notified())
        .await
        .expect("fetch started");
    assert!(!source.abandoned.load(Ordering::SeqCst));

    // Dropping the request future is what hyper does when the peer goes away.
    in_flight.abort();
    assert!(in_flight.await.is_err());

    assert!(source.abandoned.load(Ordering::SeqCst));
    assert_eq!(state.cached_funnel_count().await, 0);
}

// ============================================================
// BDD: Rollups return trailing 24h, 7 day and 30 day funnels
// ============================================================
#[tokio::test]
async fn test_rollups_cover_trailing_windows() {
    let (state, app) = setup(Config::default());
    seed(&state).await;
    state
        .db
        .insert_events(&[event("page-view", "c", at(20, 8), None, &[])])
        .await
        .expect("seed later event");

    let (status, json) = get(&app, "/api/funnel/rollups?as_of=2024-03-21").await;
    assert_eq!(status, StatusCode::OK);

    let data = &json["data"];
    assert_eq!(data["as_of"], "2024-03-21");
    assert_eq!(data["timezone"], "UTC");
    assert_eq!(data["last_24h"]["window"]["start"], "2024-03-20");
    assert_eq!(data["last_24h"]["total_actors"], 1);
    assert_eq!(data["last_7d"]["total_events"], 1);
    assert_eq!(data["last_30d"]["total_events"], 5);
    assert_eq!(data["last_30d"]["total_actors"], 3);
    assert_eq!(data["last_30d"]["funnel"]["stages"][0]["actors"], 3);
    assert_eq!(data["last_30d"]["funnel"]["overall_rate"], 33.3);

    let (status, json) = get(
        &app,
        "/api/funnel/rollups?as_of=2024-03-21&utm_source=facebook",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["last_30d"]["total_events"], 3);
    assert_eq!(json["data"]["filter"]["utm_source"], "facebook");
}

#[tokio::test]
async fn test_rollups_reject_invalid_input() {
    let (_state, app) = setup(Config::default());
    for uri in [
        "/api/funnel/rollups?as_of=21-03-2024",
        "/api/funnel/rollups?gating=strict",
        "/api/funnel/rollups?timezone=Mars/Olympus",
    ] {
        let (status, json) = get(&app, uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(json["error"]["code"], "validation_error", "{uri}");
    }
}
