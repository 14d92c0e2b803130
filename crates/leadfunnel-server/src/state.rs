use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tokio::sync::Mutex;

use leadfunnel_core::analytics::{
    EventSource, FunnelQuery, FunnelResponse, FunnelRollups, RollupQuery,
};
use leadfunnel_core::{EngineConfig, FunnelEngine};
use leadfunnel_duckdb::DuckDbEventStore;

use crate::config::Config;

/// Upper bound on cached results per endpoint. When full, the oldest entry
/// is evicted to make room.
pub const MAX_CACHED_RESULTS: usize = 256;

/// Successful results keyed by their normalised query, each valid for one TTL.
pub struct ResultCache<K, V> {
    entries: HashMap<K, (Instant, Arc<V>)>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> ResultCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, key: &K, ttl: Duration) -> Option<Arc<V>> {
        match self.entries.get(key) {
            Some((stored_at, value)) if stored_at.elapsed() < ttl => Some(Arc::clone(value)),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&mut self, key: K, value: Arc<V>, ttl: Duration) {
        self.entries
            .retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (stored_at, _))| *stored_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key, (Instant::now(), value));
    }
}

/// Shared application state injected into every Axum handler via
/// [`axum::extract::State`].
pub struct AppState {
    /// Event log. Also the engine's [`EventSource`] unless another one was
    /// supplied through [`AppState::with_source`].
    pub db: Arc<DuckDbEventStore>,

    pub engine: FunnelEngine,

    /// Parsed configuration, loaded once at startup from environment variables.
    pub config: Arc<Config>,

    /// Entries older than `config.cache_ttl()` are treated as absent and
    /// replaced on the next miss. Only successful results are stored.
    funnel_cache: Mutex<ResultCache<FunnelQuery, FunnelResponse>>,
    rollup_cache: Mutex<ResultCache<(RollupQuery, NaiveDate), FunnelRollups>>,
}

impl AppState {
    pub fn new(db: DuckDbEventStore, config: Config) -> Self {
        let db = Arc::new(db);
        let source: Arc<dyn EventSource> = db.clone();
        Self::with_source(db, source, config)
    }

    /// Serve queries from `source` while `db` still answers health checks.
    pub fn with_source(
        db: Arc<DuckDbEventStore>,
        source: Arc<dyn EventSource>,
        config: Config,
    ) -> Self {
        let engine = FunnelEngine::new(source, EngineConfig::from_config(&config));
        Self {
            db,
            engine,
            config: Arc::new(config),
            funnel_cache: Mutex::new(ResultCache::new(MAX_CACHED_RESULTS)),
            rollup_cache: Mutex::new(ResultCache::new(MAX_CACHED_RESULTS)),
        }
    }

    fn cache_ttl(&self) -> Option<Duration> {
        let ttl = self.config.cache_ttl();
        (!ttl.is_zero()).then_some(ttl)
    }

    pub async fn cached_funnel(&self, query: &FunnelQuery) -> Option<Arc<FunnelResponse>> {
        let ttl = self.cache_ttl()?;
        self.funnel_cache.lock().await.get(query, ttl)
    }

    pub async fn store_funnel(&self, query: FunnelQuery, response: Arc<FunnelResponse>) {
        if let Some(ttl) = self.cache_ttl() {
            self.funnel_cache.lock().await.insert(query, response, ttl);
        }
    }

    pub async fn cached_funnel_count(&self) -> usize {
        self.funnel_cache.lock().await.len()
    }

    pub async fn cached_rollups(
        &self,
        query: &RollupQuery,
        as_of: NaiveDate,
    ) -> Option<Arc<FunnelRollups>> {
        let ttl = self.cache_ttl()?;
        self.rollup_cache
            .lock()
            .await
            .get(&(query.clone(), as_of), ttl)
    }

    pub async fn store_rollups(
        &self,
        query: RollupQuery,
        as_of: NaiveDate,
        rollups: Arc<FunnelRollups>,
    ) {
        if let Some(ttl) = self.cache_ttl() {
            self.rollup_cache
                .lock()
                .await
                .insert((query, as_of), rollups, ttl);
        }
    }
}
