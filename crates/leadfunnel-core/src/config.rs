use std::time::Duration;

use chrono_tz::Tz;

use crate::attribution::ChannelRule;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: String,
    /// DuckDB size string such as `"1GB"`.
    pub duckdb_memory_limit: String,
    /// Reporting timezone used when a query does not name one.
    pub default_timezone: Tz,
    pub fetch_timeout_ms: u64,
    /// Upper bound on concurrently running reducers per query.
    pub worker_count: usize,
    /// Result cache lifetime in the HTTP layer. `0` disables caching.
    pub cache_ttl_secs: u64,
    /// Days projected past the window end. `0` disables the forecast.
    pub forecast_days: u32,
    /// When set, only page views on a path containing this value count as
    /// landing views.
    pub landing_path: Option<String>,
    pub channels: Vec<ChannelRule>,
    pub cors_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            data_dir: "./data".to_string(),
            duckdb_memory_limit: "1GB".to_string(),
            default_timezone: Tz::UTC,
            fetch_timeout_ms: 10_000,
            worker_count: 4,
            cache_ttl_secs: 60,
            forecast_days: 7,
            landing_path: None,
            channels: vec![ChannelRule::meta(), ChannelRule::google_ads()],
            cors_origins: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. `from_env` passes the process
    /// environment; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Ok(Self {
            port: match var("LEADFUNNEL_PORT") {
                Some(raw) => raw.parse().map_err(|e| format!("invalid port: {e}"))?,
                None => defaults.port,
            },
            data_dir: var("LEADFUNNEL_DATA_DIR").unwrap_or(defaults.data_dir),
            duckdb_memory_limit: var("LEADFUNNEL_DUCKDB_MEMORY")
                .unwrap_or(defaults.duckdb_memory_limit),
            default_timezone: match var("LEADFUNNEL_TIMEZONE") {
                Some(raw) => raw
                    .parse::<Tz>()
                    .map_err(|_| format!("invalid timezone: {raw}"))?,
                None => defaults.default_timezone,
            },
            fetch_timeout_ms: match var("LEADFUNNEL_FETCH_TIMEOUT_MS") {
                Some(raw) => raw
                    .parse()
                    .map_err(|e| format!("invalid fetch timeout: {e}"))?,
                None => defaults.fetch_timeout_ms,
            },
            worker_count: var("LEADFUNNEL_WORKERS")
                .and_then(|raw| raw.parse::<usize>().ok())
                .unwrap_or(defaults.worker_count)
                .max(1),
            cache_ttl_secs: var("LEADFUNNEL_CACHE_TTL_SECS")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.cache_ttl_secs),
            forecast_days: match var("LEADFUNNEL_FORECAST_DAYS") {
                Some(raw) => raw
                    .parse()
                    .map_err(|e| format!("invalid forecast days: {e}"))?,
                None => defaults.forecast_days,
            },
            landing_path: var("LEADFUNNEL_LANDING_PATH"),
            channels: match lookup("LEADFUNNEL_CHANNELS") {
                Some(raw) => ChannelRule::parse_list(&raw)?,
                None => defaults.channels,
            },
            cors_origins: var("LEADFUNNEL_CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|o| !o.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
