use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::{Connection, InterruptHandle};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use leadfunnel_core::analytics::{FetchRequest, FunnelFilter};
use leadfunnel_core::event::{EventAttributes, TrackingEvent};

use crate::DuckDbEventStore;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// UTC timestamp in the literal form DuckDB casts to `TIMESTAMP`.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.naive_utc().format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .map(|naive| naive.and_utc())
        .map_err(|_| anyhow!("invalid occurred_at: {raw}"))
}

pub(crate) fn attributes_to_json(attributes: &EventAttributes) -> Result<String> {
    serde_json::to_string(attributes).context("serialize attributes")
}

/// Decode a stored attribute blob. Scalars are stringified and nulls are
/// dropped; anything but a JSON object is an error.
pub(crate) fn attributes_from_json(raw: &str) -> Result<EventAttributes> {
    let value: Value = serde_json::from_str(raw).context("attributes are not valid JSON")?;
    let Value::Object(map) = value else {
        return Err(anyhow!("attributes must be a JSON object"));
    };
    Ok(map
        .into_iter()
        .filter_map(|(key, value)| match value {
            Value::Null => None,
            Value::String(s) => Some((key, s)),
            other => Some((key, other.to_string())),
        })
        .collect())
}

fn append_filters(
    filter: &FunnelFilter,
    filter_sql: &mut String,
    params: &mut Vec<Box<dyn duckdb::types::ToSql>>,
    param_idx: &mut usize,
) {
    if let Some(ref utm_source) = filter.utm_source {
        filter_sql.push_str(&format!(" AND trim(utm_source) = ?{}", *param_idx));
        params.push(Box::new(utm_source.trim().to_string()));
        *param_idx += 1;
    }
    if let Some(ref utm_campaign) = filter.utm_campaign {
        filter_sql.push_str(&format!(" AND trim(utm_campaign) = ?{}", *param_idx));
        params.push(Box::new(utm_campaign.trim().to_string()));
        *param_idx += 1;
    }
}

type RawRow = (
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn decode_row(row: RawRow) -> Result<TrackingEvent> {
    let (
        id,
        event_type,
        actor_id,
        session_id,
        occurred_at,
        attributes,
        utm_source,
        utm_medium,
        utm_campaign,
    ) = row;
    let attributes = match attributes.as_deref() {
        None | Some("") => EventAttributes::new(),
        Some(raw) => {
            attributes_from_json(raw).with_context(|| format!("event {id} has bad attributes"))?
        }
    };
    Ok(TrackingEvent {
        occurred_at: parse_timestamp(&occurred_at)?,
        id,
        event_type,
        actor_id,
        session_id,
        attributes,
        utm_source,
        utm_medium,
        utm_campaign,
    })
}

/// Interrupts the running DuckDB statement and stops row decoding when the
/// fetch future is dropped before the blocking query hands back its rows.
struct AbortOnDrop {
    interrupt: Arc<InterruptHandle>,
    stop: CancellationToken,
    armed: bool,
}

impl AbortOnDrop {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.stop.cancel();
            self.interrupt.interrupt();
            tracing::debug!("event fetch abandoned, interrupting DuckDB");
        }
    }
}

fn query_events(
    conn: &Connection,
    request: &FetchRequest,
    stop: &CancellationToken,
) -> Result<Vec<TrackingEvent>> {
    let mut params: Vec<Box<dyn duckdb::types::ToSql>> = vec![
        Box::new(format_timestamp(&request.start)),
        Box::new(format_timestamp(&request.end)),
    ];
    let mut param_idx = 3;
    let mut filter_sql = String::new();
    append_filters(&request.filter, &mut filter_sql, &mut params, &mut param_idx);

    let sql = format!(
        r#"SELECT
            id, event_type, actor_id, session_id, CAST(occurred_at AS VARCHAR),
            attributes, utm_source, utm_medium, utm_campaign
        FROM tracking_events
        WHERE occurred_at >= ?1
          AND occurred_at < ?2
          {filter_sql}
        ORDER BY occurred_at, id"#
    );

    let param_refs: Vec<&dyn duckdb::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(param_refs.as_slice(), |row| {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
        ))
    })?;

    let mut events = Vec::new();
    for row in rows {
        if stop.is_cancelled() {
            return Err(anyhow!("event fetch abandoned"));
        }
        let raw: RawRow = row?;
        events.push(decode_row(raw)?);
    }
    Ok(events)
}

/// Every event in `[request.start, request.end)` matching the filters,
/// ordered by time then id.
///
/// The query runs on the blocking pool. Dropping the returned future (a
/// caller timeout or cancellation) interrupts the statement, and the
/// connection is released as soon as the blocking side notices.
pub async fn fetch_events_inner(
    db: &DuckDbEventStore,
    request: &FetchRequest,
) -> Result<Vec<TrackingEvent>> {
    let conn = Arc::clone(&db.conn).lock_owned().await;
    let stop = CancellationToken::new();
    let guard = AbortOnDrop {
        interrupt: conn.interrupt_handle(),
        stop: stop.clone(),
        armed: true,
    };

    let owned = request.clone();
    let events = tokio::task::spawn_blocking(move || query_events(&conn, &owned, &stop))
        .await
        .context("event fetch task failed")??;
    guard.disarm();

    tracing::debug!(
        count = events.len(),
        start = %request.start,
        end = %request.end,
        "fetched tracking events"
    );
    Ok(events)
}
