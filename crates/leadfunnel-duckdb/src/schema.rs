/// DuckDB initialization SQL.
///
/// Executed once at open time via `Connection::execute_batch`. Every
/// statement uses `IF NOT EXISTS` so it is safe to re-run on each startup.
///
/// `memory_limit` comes from `Config.duckdb_memory_limit`
/// (env `LEADFUNNEL_DUCKDB_MEMORY`, default `"1GB"`). Always set an explicit
/// limit: the DuckDB default of 80% of system RAM is not acceptable for a
/// server process.
///
/// `occurred_at` is stored as a naive UTC `TIMESTAMP`. `attributes` holds a
/// JSON object serialized to text.
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

CREATE TABLE IF NOT EXISTS tracking_events (
    id              VARCHAR PRIMARY KEY,
    event_type      VARCHAR NOT NULL,
    actor_id        VARCHAR,                       -- NULL for anonymous traffic
    session_id      VARCHAR NOT NULL,
    occurred_at     TIMESTAMP NOT NULL,            -- UTC
    attributes      VARCHAR NOT NULL DEFAULT '{{}}',
    utm_source      VARCHAR,
    utm_medium      VARCHAR,
    utm_campaign    VARCHAR
);
CREATE INDEX IF NOT EXISTS idx_tracking_events_occurred ON tracking_events(occurred_at);
CREATE INDEX IF NOT EXISTS idx_tracking_events_source   ON tracking_events(utm_source, occurred_at);
CREATE INDEX IF NOT EXISTS idx_tracking_events_campaign ON tracking_events(utm_campaign, occurred_at);
"#
    )
}
