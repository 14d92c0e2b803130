use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use leadfunnel_core::analytics::{FunnelFilter, FunnelGating, FunnelQuery, RollupQuery};

use crate::{error::AppError, state::AppState};

const DEFAULT_RANGE_DAYS: i64 = 7;
const MAX_RANGE_DAYS: i64 = 366;
const MAX_FILTER_LEN: usize = 200;

#[derive(Debug, Deserialize)]
pub struct FunnelParams {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub timezone: Option<String>,
    pub utm_source: Option<String>,
    pub utm_campaign: Option<String>,
    pub gating: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RollupParams {
    pub as_of: Option<String>,
    pub timezone: Option<String>,
    pub utm_source: Option<String>,
    pub utm_campaign: Option<String>,
    pub gating: Option<String>,
}

fn parse_date_range(
    start_date: Option<&str>,
    end_date: Option<&str>,
    today: NaiveDate,
) -> Result<(NaiveDate, NaiveDate), AppError> {
    let end = match end_date {
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
            AppError::BadRequest("invalid end_date (expected YYYY-MM-DD)".to_string())
        })?,
        None => today,
    };
    let start = match start_date {
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
            AppError::BadRequest("invalid start_date (expected YYYY-MM-DD)".to_string())
        })?,
        None => end - chrono::Duration::days(DEFAULT_RANGE_DAYS - 1),
    };
    if end < start {
        return Err(AppError::BadRequest(
            "end_date must be on or after start_date".to_string(),
        ));
    }
    let range_days = (end - start).num_days() + 1;
    if range_days > MAX_RANGE_DAYS {
        return Err(AppError::BadRequest(format!(
            "date range too large: {range_days} days (max {MAX_RANGE_DAYS})"
        )));
    }
    Ok((start, end))
}

fn normalize_optional_filter(
    field: &str,
    value: Option<String>,
    max_len: usize,
) -> Result<Option<String>, AppError> {
    let Some(raw) = value else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.len() > max_len {
        return Err(AppError::BadRequest(format!(
            "{field} is too long (max {max_len} characters)"
        )));
    }
    Ok(Some(trimmed.to_string()))
}

fn parse_filter(
    utm_source: Option<String>,
    utm_campaign: Option<String>,
) -> Result<FunnelFilter, AppError> {
    Ok(FunnelFilter {
        utm_source: normalize_optional_filter("utm_source", utm_source, MAX_FILTER_LEN)?,
        utm_campaign: normalize_optional_filter("utm_campaign", utm_campaign, MAX_FILTER_LEN)?,
    })
}

fn resolve_timezone_name(requested: Option<&str>, default_timezone: &str) -> String {
    requested
        .map(str::trim)
        .filter(|tz| !tz.is_empty())
        .unwrap_or(default_timezone)
        .to_string()
}

/// Turn raw query-string parameters into the engine query. The timezone is
/// resolved to a concrete name so equivalent requests share a cache entry.
fn build_query(
    params: FunnelParams,
    default_timezone: &str,
    today: NaiveDate,
) -> Result<FunnelQuery, AppError> {
    let (start, end) =
        parse_date_range(params.start_date.as_deref(), params.end_date.as_deref(), today)?;
    let gating = FunnelGating::parse(params.gating.as_deref())
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    let timezone = resolve_timezone_name(params.timezone.as_deref(), default_timezone);

    let mut query = FunnelQuery::new(start, end);
    query.filter = parse_filter(params.utm_source, params.utm_campaign)?;
    query.timezone = Some(timezone);
    query.gating = gating;
    Ok(query)
}

/// `GET /api/funnel` - stage funnel plus attribution breakdowns for a window.
///
/// If the client goes away before the engine finishes, the handler future is
/// dropped and the drop guard cancels the computation.
pub async fn get_funnel(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FunnelParams>,
) -> Result<impl IntoResponse, AppError> {
    let today = chrono::Utc::now().date_naive();
    let query = build_query(params, state.engine.default_timezone().name(), today)?;

    if let Some(hit) = state.cached_funnel(&query).await {
        tracing::debug!(start = %query.window.start, end = %query.window.end, "funnel cache hit");
        return Ok(Json(json!({ "data": hit.as_ref() })));
    }

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let result = state
        .engine
        .compute_funnel_with_cancel(&query, &cancel)
        .await;
    guard.disarm();

    let response = Arc::new(result?);
    state.store_funnel(query, Arc::clone(&response)).await;
    Ok(Json(json!({ "data": response.as_ref() })))
}

/// `as_of` defaults to today in the reporting timezone. An unknown timezone
/// falls back to the UTC date here and is rejected by the engine.
fn build_rollup_query(
    params: RollupParams,
    default_timezone: &str,
    utc_now: chrono::DateTime<chrono::Utc>,
) -> Result<(RollupQuery, NaiveDate), AppError> {
    let timezone = resolve_timezone_name(params.timezone.as_deref(), default_timezone);
    let as_of = match params.as_of.as_deref() {
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
            AppError::BadRequest("invalid as_of (expected YYYY-MM-DD)".to_string())
        })?,
        None => match timezone.parse::<Tz>() {
            Ok(tz) => utc_now.with_timezone(&tz).date_naive(),
            Err(_) => utc_now.date_naive(),
        },
    };
    let query = RollupQuery {
        filter: parse_filter(params.utm_source, params.utm_campaign)?,
        timezone: Some(timezone),
        gating: FunnelGating::parse(params.gating.as_deref())
            .map_err(|e| AppError::BadRequest(e.to_string()))?,
    };
    Ok((query, as_of))
}

/// `GET /api/funnel/rollups` - last 24h, 7 day and 30 day funnels ending on
/// `as_of`.
pub async fn get_rollups(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RollupParams>,
) -> Result<impl IntoResponse, AppError> {
    let (query, as_of) = build_rollup_query(
        params,
        state.engine.default_timezone().name(),
        chrono::Utc::now(),
    )?;

    if let Some(hit) = state.cached_rollups(&query, as_of).await {
        tracing::debug!(as_of = %as_of, "rollup cache hit");
        return Ok(Json(json!({ "data": hit.as_ref() })));
    }

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let result = state
        .engine
        .compute_rollups_with_cancel(&query, as_of, &cancel)
        .await;
    guard.disarm();

    let rollups = Arc::new(result?);
    state
        .store_rollups(query, as_of, Arc::clone(&rollups))
        .await;
    Ok(Json(json!({ "data": rollups.as_ref() })))
}
