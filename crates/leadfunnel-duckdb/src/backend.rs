use std::sync::Arc;

use anyhow::{Context, Result};
use duckdb::Connection;
use tokio::sync::Mutex;
use tracing::info;

use leadfunnel_core::event::TrackingEvent;

use crate::events::{attributes_to_json, format_timestamp};
use crate::schema::init_sql;

/// DuckDB-backed tracking event log.
///
/// DuckDB is single-writer, so the connection sits behind
/// `Arc<Mutex<_>>`: appends are serialised while the store stays cheap to
/// share between the engine and HTTP handlers.
///
/// The memory limit is applied by [`init_sql`] at open time and is
/// configurable via `LEADFUNNEL_DUCKDB_MEMORY` (default `"1GB"`).
pub struct DuckDbEventStore {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl DuckDbEventStore {
    /// Open (or create) a DuckDB database file at `path`.
    ///
    /// `memory_limit` is a DuckDB size string such as `"1GB"` or `"512MB"`.
    pub fn open(path: &str, memory_limit: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open duckdb at {path}"))?;
        conn.execute_batch(&init_sql(memory_limit))?;
        info!(
            "DuckDB opened at {} with memory_limit={}, threads=2",
            path, memory_limit
        );
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an **in-memory** database. Data is discarded on drop.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(&init_sql("1GB"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append a batch of events in a single transaction.
    ///
    /// Returns immediately if `events` is empty. Re-inserting an existing `id`
    /// fails the whole batch.
    pub async fn insert_events(&self, events: &[TrackingEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        for event in events {
            tx.execute(
                r#"INSERT INTO tracking_events (
                    id, event_type, actor_id, session_id, occurred_at,
                    attributes, utm_source, utm_medium, utm_campaign
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
                duckdb::params![
                    event.id,
                    event.event_type,
                    event.actor_id,
                    event.session_id,
                    format_timestamp(&event.occurred_at),
                    attributes_to_json(&event.attributes)?,
                    event.utm_source,
                    event.utm_medium,
                    event.utm_campaign,
                ],
            )
            .with_context(|| format!("insert event {}", event.id))?;
        }

        tx.commit()?;
        tracing::debug!("Inserted {} tracking events", events.len());
        Ok(())
    }

    /// Execute `SELECT 1` as a lightweight liveness check.
    pub async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch("SELECT 1")?;
        Ok(())
    }

    /// Acquire the connection lock for direct queries.
    ///
    /// Intended for integration tests that need to seed or inspect raw rows.
    pub async fn conn_for_test(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}
