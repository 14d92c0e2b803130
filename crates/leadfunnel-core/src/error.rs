use std::time::Duration;

use chrono::NaiveDate;
use thiserror::Error;

/// Everything `compute_funnel` can fail with. A failed call never yields a
/// partial response.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid window: start {start} is after end {end}")]
    InvalidWindow { start: NaiveDate, end: NaiveDate },

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("event fetch failed: {0:#}")]
    Fetch(#[source] anyhow::Error),

    #[error("event fetch timed out after {0:?}")]
    FetchTimeout(Duration),

    #[error("funnel computation cancelled")]
    Cancelled,

    #[error("aggregation failed: {0}")]
    Aggregation(String),
}

impl EngineError {
    /// Errors caused by the query rather than by storage or the engine.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidWindow { .. } | EngineError::InvalidTimezone(_)
        )
    }
}
