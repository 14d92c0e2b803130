use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use leadfunnel_core::analytics::{EventSource, FetchRequest, FunnelFilter, FunnelQuery};
use leadfunnel_core::classify::FunnelStage;
use leadfunnel_core::event::{EventAttributes, TrackingEvent};
use leadfunnel_core::{EngineConfig, EngineError, FunnelEngine};
use leadfunnel_duckdb::DuckDbEventStore;
use tokio_util::sync::CancellationToken;

fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, hour, minute, 0)
        .single()
        .expect("valid timestamp")
}

fn event(
    event_type: &str,
    actor: Option<&str>,
    occurred_at: DateTime<Utc>,
    source: Option<&str>,
    campaign: Option<&str>,
) -> TrackingEvent {
    let mut attributes = EventAttributes::new();
    attributes.insert("page_path", "/financiamientos");
    TrackingEvent {
        id: uuid::Uuid::new_v4().to_string(),
        event_type: event_type.to_string(),
        actor_id: actor.map(str::to_string),
        session_id: format!("sess-{}", actor.unwrap_or("anon")),
        occurred_at,
        attributes,
        utm_source: source.map(str::to_string),
        utm_medium: None,
        utm_campaign: campaign.map(str::to_string),
    }
}

fn request(start: DateTime<Utc>, end: DateTime<Utc>) -> FetchRequest {
    FetchRequest {
        start,
        end,
        filter: FunnelFilter::default(),
    }
}

async fn seeded() -> DuckDbEventStore {
    let db = DuckDbEventStore::open_in_memory().expect("in-memory DuckDB");
    db.insert_events(&[
        event("page-view", Some("a"), at(1, 10, 0), Some("meta"), Some("spring24")),
        event("lead-complete", Some("a"), at(1, 11, 30), Some("meta"), Some("spring24")),
        event("page-view", Some("b"), at(2, 0, 0), Some("google"), Some("winter23")),
        event("page-view", None, at(2, 23, 59), None, None),
        event("page-view", Some("c"), at(3, 0, 0), Some("meta"), None),
    ])
    .await
    .expect("insert events");
    db
}

#[tokio::test]
async fn test_insert_and_fetch_round_trip() {
    let db = seeded().await;
    let fetched = db
        .fetch_events(&request(at(1, 0, 0), at(4, 0, 0)))
        .await
        .expect("fetch");
    assert_eq!(fetched.len(), 5);
    assert_eq!(fetched[0].event_type, "page-view");
    assert_eq!(fetched[0].occurred_at, at(1, 10, 0));
    assert_eq!(
        fetched[0].attributes.page_path().as_deref(),
        Some("/financiamientos")
    );
    assert_eq!(fetched[3].actor_id, None);
    let times: Vec<DateTime<Utc>> = fetched.iter().map(|e| e.occurred_at).collect();
    let mut sorted = times.clone();
    sorted.sort();
    assert_eq!(times, sorted);
}

#[tokio::test]
async fn test_window_end_is_exclusive() {
    let db = seeded().await;
    let fetched = db
        .fetch_events(&request(at(2, 0, 0), at(3, 0, 0)))
        .await
        .expect("fetch");
    assert_eq!(fetched.len(), 2);
    assert!(fetched.iter().all(|e| e.occurred_at < at(3, 0, 0)));
}

#[tokio::test]
async fn test_filters_apply_in_sql() {
    let db = seeded().await;
    let mut req = request(at(1, 0, 0), at(4, 0, 0));
    req.filter.utm_source = Some("meta".to_string());
    assert_eq!(db.fetch_events(&req).await.expect("fetch").len(), 3);

    req.filter.utm_campaign = Some("spring24".to_string());
    let fetched = db.fetch_events(&req).await.expect("fetch");
    assert_eq!(fetched.len(), 2);
    assert!(fetched
        .iter()
        .all(|e| e.utm_campaign.as_deref() == Some("spring24")));
}

#[tokio::test]
async fn test_empty_window_is_not_an_error() {
    let db = seeded().await;
    let fetched = db
        .fetch_events(&request(at(20, 0, 0), at(21, 0, 0)))
        .await
        .expect("fetch");
    assert!(fetched.is_empty());
}

#[tokio::test]
async fn test_corrupt_attributes_fail_the_fetch() {
    let db = seeded().await;
    {
        let conn = db.conn_for_test().await;
        conn.execute(
            "INSERT INTO tracking_events (id, event_type, session_id, occurred_at, attributes)
             VALUES ('bad', 'page-view', 's', '2024-03-01 12:00:00', '[1,2,3]')",
            [],
        )
        .expect("insert corrupt row");
    }
    let result = db.fetch_events(&request(at(1, 0, 0), at(4, 0, 0))).await;
    let err = result.expect_err("corrupt attributes must surface");
    assert!(format!("{err:#}").contains("bad"));
}

#[tokio::test]
async fn test_duplicate_id_rolls_back_batch() {
    let db = DuckDbEventStore::open_in_memory().expect("in-memory DuckDB");
    let first = event("page-view", Some("a"), at(1, 10, 0), None, None);
    db.insert_events(std::slice::from_ref(&first))
        .await
        .expect("first insert");
    let fresh = event("page-view", Some("b"), at(1, 11, 0), None, None);
    let result = db.insert_events(&[fresh, first]).await;
    assert!(result.is_err());

    let conn = db.conn_for_test().await;
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM tracking_events", [], |row| row.get(0))
        .expect("count");
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_ping() {
    let db = DuckDbEventStore::open_in_memory().expect("in-memory DuckDB");
    db.ping().await.expect("ping");
}

#[tokio::test]
async fn test_engine_over_duckdb() {
    let db = Arc::new(seeded().await);
    let engine = FunnelEngine::new(db, EngineConfig::default());
    let query = FunnelQuery::new(
        NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"),
        NaiveDate::from_ymd_opt(2024, 3, 2).expect("date"),
    );
    let response = engine.compute_funnel(&query).await.expect("funnel");
    assert_eq!(response.total_events, 4);
    assert_eq!(response.total_actors, 2);
    let landing = response
        .funnel
        .stage(FunnelStage::LandingView)
        .expect("landing stage");
    assert_eq!(landing.actors, 2);
    assert_eq!(response.funnel.overall_rate, 50.0);
    assert_eq!(response.campaigns.len(), 2);
    assert_eq!(response.timeseries.len(), 2);
}

/// Fill 2024-03-01 with `rows` page views generated inside DuckDB.
async fn seed_bulk(db: &DuckDbEventStore, rows: u64) {
    let conn = db.conn_for_test().await;
    conn.execute_batch(&format!(
        "INSERT INTO tracking_events (id, event_type, actor_id, session_id, occurred_at, attributes)
         SELECT 'bulk-' || CAST(i AS VARCHAR),
                'page-view',
                'actor-' || CAST(i % 50000 AS VARCHAR),
                'sess-' || CAST(i % 200000 AS VARCHAR),
                TIMESTAMP '2024-03-01 00:00:00' + to_seconds(i % 86400),
                '{{\"page_path\":\"/financiamientos\"}}'
         FROM range({rows}) AS t(i)"
    ))
    .expect("bulk seed");
}

fn one_day_query() -> FunnelQuery {
    let day = NaiveDate::from_ymd_opt(2024, 3, 1).expect("date");
    FunnelQuery::new(day, day)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_fetch_times_out_and_releases_connection() {
    let db = Arc::new(DuckDbEventStore::open_in_memory().expect("in-memory DuckDB"));
    seed_bulk(&db, 1_500_000).await;

    let config = EngineConfig {
        fetch_timeout: Duration::from_millis(5),
        ..EngineConfig::default()
    };
    let engine = FunnelEngine::new(db.clone(), config);

    let started = Instant::now();
    let result = engine.compute_funnel(&one_day_query()).await;
    assert!(matches!(result, Err(EngineError::FetchTimeout(_))));
    assert!(started.elapsed() < Duration::from_secs(5));

    // The interrupted query hands the connection back promptly.
    tokio::time::timeout(Duration::from_secs(10), db.ping())
        .await
        .expect("connection released after timeout")
        .expect("ping");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_interrupts_running_fetch() {
    let db = Arc::new(DuckDbEventStore::open_in_memory().expect("in-memory DuckDB"));
    seed_bulk(&db, 1_500_000).await;
    let engine = FunnelEngine::new(db.clone(), EngineConfig::default());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = engine
        .compute_funnel_with_cancel(&one_day_query(), &cancel)
        .await;
    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));

    tokio::time::timeout(Duration::from_secs(10), db.ping())
        .await
        .expect("connection released after cancel")
        .expect("ping");
}
