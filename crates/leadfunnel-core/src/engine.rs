//! The query façade every dashboard goes through.
//!
//! One call performs exactly one fetch, normalizes it into an immutable
//! slice, fans the independent reducers out over a bounded pool of blocking
//! workers and assembles a complete [`FunnelResponse`]. Any failure, timeout
//! or cancellation yields an error and no response at all.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Days, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::{self, DayTally, Tallies};
use crate::analytics::{
    DateWindow, EventSource, FetchRequest, FunnelFilter, FunnelGating, FunnelQuery,
    FunnelResponse, FunnelRollups, RollupQuery, RollupWindow,
};
use crate::attribution::ChannelRule;
use crate::classify::{FunnelStage, StageClassifier};
use crate::config::Config;
use crate::error::EngineError;
use crate::forecast;
use crate::funnel;
use crate::identity::{self, ActorSet, IdentitySummary};
use crate::slice::{self, ClassifiedEvent};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_timezone: Tz,
    pub fetch_timeout: Duration,
    pub worker_count: usize,
    pub landing_path: Option<String>,
    pub channels: Vec<ChannelRule>,
    pub forecast_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_timezone: config.default_timezone,
            fetch_timeout: config.fetch_timeout(),
            worker_count: config.worker_count.max(1),
            landing_path: config.landing_path.clone(),
            channels: config.channels.clone(),
            forecast_days: config.forecast_days,
        }
    }
}

#[derive(Clone)]
pub struct FunnelEngine {
    source: Arc<dyn EventSource>,
    classifier: StageClassifier,
    channels: Arc<Vec<ChannelRule>>,
    default_timezone: Tz,
    fetch_timeout: Duration,
    forecast_days: u32,
    workers: Arc<Semaphore>,
}

impl FunnelEngine {
    pub fn new(source: Arc<dyn EventSource>, config: EngineConfig) -> Self {
        Self {
            source,
            classifier: StageClassifier::with_landing_path(config.landing_path),
            channels: Arc::new(config.channels),
            default_timezone: config.default_timezone,
            fetch_timeout: config.fetch_timeout,
            forecast_days: config.forecast_days,
            workers: Arc::new(Semaphore::new(config.worker_count.max(1))),
        }
    }

    pub fn channels(&self) -> &[ChannelRule] {
        &self.channels
    }

    pub fn default_timezone(&self) -> Tz {
        self.default_timezone
    }

    pub async fn compute_funnel(&self, query: &FunnelQuery) -> Result<FunnelResponse, EngineError> {
        self.compute_funnel_with_cancel(query, &CancellationToken::new())
            .await
    }

    /// Like [`compute_funnel`](Self::compute_funnel), but stops as soon as
    /// `cancel` fires. The pending fetch is dropped and queued reducers are
    /// aborted with the task set.
    #[tracing::instrument(
        skip_all,
        fields(start = %query.window.start, end = %query.window.end, gating = ?query.gating)
    )]
    pub async fn compute_funnel_with_cancel(
        &self,
        query: &FunnelQuery,
        cancel: &CancellationToken,
    ) -> Result<FunnelResponse, EngineError> {
        let started = Instant::now();
        let result = until_cancelled(cancel, self.run(query, cancel)).await;
        match &result {
            Ok(response) => info!(
                events = response.total_events,
                actors = response.total_actors,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "funnel computed"
            ),
            Err(EngineError::Cancelled) => debug!("funnel computation cancelled"),
            Err(e) => warn!(error = %e, "funnel computation failed"),
        }
        result
    }

    pub async fn compute_rollups(
        &self,
        query: &RollupQuery,
        as_of: NaiveDate,
    ) -> Result<FunnelRollups, EngineError> {
        self.compute_rollups_with_cancel(query, as_of, &CancellationToken::new())
            .await
    }

    /// Trailing 24h (yesterday and today), 7-day and 30-day funnels ending
    /// on `as_of`, all cut from one 30-day fetch.
    #[tracing::instrument(skip_all, fields(as_of = %as_of, gating = ?query.gating))]
    pub async fn compute_rollups_with_cancel(
        &self,
        query: &RollupQuery,
        as_of: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<FunnelRollups, EngineError> {
        let started = Instant::now();
        let result = until_cancelled(cancel, self.run_rollups(query, as_of, cancel)).await;
        match &result {
            Ok(rollups) => info!(
                events = rollups.last_30d.total_events,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "funnel rollups computed"
            ),
            Err(EngineError::Cancelled) => debug!("funnel rollups cancelled"),
            Err(e) => warn!(error = %e, "funnel rollups failed"),
        }
        result
    }

    async fn run(
        &self,
        query: &FunnelQuery,
        cancel: &CancellationToken,
    ) -> Result<FunnelResponse, EngineError> {
        let window = query.window;
        let (tz, slice) = self
            .fetch_slice(window, &query.filter, query.timezone.as_deref())
            .await?;
        let parts = self.fan_out(Arc::clone(&slice), window, cancel).await?;
        self.assemble(query, tz, &slice, parts)
    }

    async fn run_rollups(
        &self,
        query: &RollupQuery,
        as_of: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<FunnelRollups, EngineError> {
        let windows = [
            trailing_window(as_of, 2)?,
            trailing_window(as_of, 7)?,
            trailing_window(as_of, 30)?,
        ];
        let (tz, slice) = self
            .fetch_slice(windows[2], &query.filter, query.timezone.as_deref())
            .await?;

        let permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Aggregation("worker pool closed".to_string()))?;
        let gating = query.gating;
        let worker_cancel = cancel.clone();
        let rolled = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            if worker_cancel.is_cancelled() {
                return None;
            }
            Some(windows.map(|window| rollup_window(&slice, window, gating)))
        })
        .await
        .map_err(|e| EngineError::Aggregation(e.to_string()))?
        .ok_or(EngineError::Cancelled)?;
        let [last_24h, last_7d, last_30d] = rolled;

        Ok(FunnelRollups {
            as_of,
            timezone: tz.name().to_string(),
            filter: query.filter.clone(),
            last_24h,
            last_7d,
            last_30d,
        })
    }

    /// Validate, fetch once under the timeout and normalize into the slice
    /// every reducer reads.
    async fn fetch_slice(
        &self,
        window: DateWindow,
        filter: &FunnelFilter,
        timezone: Option<&str>,
    ) -> Result<(Tz, Arc<Vec<ClassifiedEvent>>), EngineError> {
        if !window.is_valid() {
            return Err(EngineError::InvalidWindow {
                start: window.start,
                end: window.end,
            });
        }
        let tz = self.resolve_timezone(timezone)?;
        let (start, end) = utc_bounds(tz, &window)?;

        let request = FetchRequest {
            start,
            end,
            filter: filter.clone(),
        };
        let fetched =
            match tokio::time::timeout(self.fetch_timeout, self.source.fetch_events(&request))
                .await
            {
                Ok(Ok(events)) => events,
                Ok(Err(e)) => return Err(EngineError::Fetch(e)),
                Err(_) => return Err(EngineError::FetchTimeout(self.fetch_timeout)),
            };
        let fetched_count = fetched.len();

        let slice = Arc::new(slice::normalize(
            fetched,
            start,
            end,
            filter,
            tz,
            &self.classifier,
        ));
        debug!(
            fetched = fetched_count,
            kept = slice.len(),
            timezone = %tz,
            "event slice normalized"
        );
        Ok((tz, slice))
    }

    fn resolve_timezone(&self, requested: Option<&str>) -> Result<Tz, EngineError> {
        match requested {
            None => Ok(self.default_timezone),
            Some(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err(EngineError::InvalidTimezone(raw.to_string()));
                }
                trimmed
                    .parse::<Tz>()
                    .map_err(|_| EngineError::InvalidTimezone(trimmed.to_string()))
            }
        }
    }

    async fn fan_out(
        &self,
        slice: Arc<Vec<ClassifiedEvent>>,
        window: DateWindow,
        cancel: &CancellationToken,
    ) -> Result<Parts, EngineError> {
        let mut jobs = vec![
            Job::Identity,
            Job::Sources,
            Job::Campaigns,
            Job::Pages,
            Job::EventTypes,
            Job::Days(window),
        ];
        jobs.extend((0..self.channels.len()).map(Job::Channel));

        let mut tasks = JoinSet::new();
        for job in jobs {
            let permit = Arc::clone(&self.workers)
                .acquire_owned()
                .await
                .map_err(|_| EngineError::Aggregation("worker pool closed".to_string()))?;
            let slice = Arc::clone(&slice);
            let channels = Arc::clone(&self.channels);
            let cancel = cancel.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                if cancel.is_cancelled() {
                    return Partial::Skipped;
                }
                job.run(&slice, &channels)
            });
        }

        let mut parts = Parts::new(self.channels.len());
        while let Some(joined) = tasks.join_next().await {
            let partial = joined.map_err(|e| EngineError::Aggregation(e.to_string()))?;
            parts.absorb(partial);
        }
        Ok(parts)
    }

    fn assemble(
        &self,
        query: &FunnelQuery,
        tz: Tz,
        slice: &[ClassifiedEvent],
        parts: Parts,
    ) -> Result<FunnelResponse, EngineError> {
        let identity = parts.identity.ok_or_else(|| missing("identity"))?;
        let converted = identity.stages.get(FunnelStage::LeadComplete);
        let total_events = slice.len() as u64;
        let timeseries = aggregate::finish_days(
            parts.days.ok_or_else(|| missing("timeseries"))?,
            converted,
        );

        let mut channel_funnels = Vec::with_capacity(self.channels.len());
        for (rule, actors) in self.channels.iter().zip(parts.channels) {
            let actors = actors.ok_or_else(|| missing(&rule.name))?;
            channel_funnels.push(funnel::channel_funnel(
                &rule.name,
                &identity.stages,
                &actors,
                query.gating,
            ));
        }

        Ok(FunnelResponse {
            window: query.window,
            timezone: tz.name().to_string(),
            filter: query.filter.clone(),
            total_events,
            total_actors: identity.actors.len(),
            total_sessions: identity.sessions.len(),
            funnel: funnel::assemble(&identity.stages, query.gating),
            channel_funnels,
            sources: aggregate::finish_sources(
                parts.sources.ok_or_else(|| missing("sources"))?,
                converted,
            ),
            campaigns: aggregate::finish_campaigns(
                parts.campaigns.ok_or_else(|| missing("campaigns"))?,
                converted,
            ),
            pages: aggregate::finish_pages(parts.pages.ok_or_else(|| missing("pages"))?, converted),
            event_types: aggregate::finish_event_types(
                parts.event_types.ok_or_else(|| missing("event types"))?,
                total_events,
                converted,
            ),
            forecast: forecast::forecast(&timeseries, self.forecast_days),
            timeseries,
        })
    }
}

async fn until_cancelled<T, F>(cancel: &CancellationToken, work: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        result = work => result,
    }
}

fn missing(what: &str) -> EngineError {
    EngineError::Aggregation(format!("{what} reducer produced no result"))
}

/// The `days` calendar days ending on `as_of`, inclusive.
fn trailing_window(as_of: NaiveDate, days: u64) -> Result<DateWindow, EngineError> {
    let start = as_of
        .checked_sub_days(Days::new(days.saturating_sub(1)))
        .ok_or(EngineError::InvalidWindow {
            start: as_of,
            end: as_of,
        })?;
    Ok(DateWindow::new(start, as_of))
}

fn rollup_window(
    slice: &[ClassifiedEvent],
    window: DateWindow,
    gating: FunnelGating,
) -> RollupWindow {
    let in_window = slice
        .iter()
        .filter(|item| item.day >= window.start && item.day <= window.end);
    let total_events = in_window.clone().count() as u64;
    let identity = identity::resolve_identities(in_window);
    RollupWindow {
        window,
        total_events,
        total_actors: identity.actors.len(),
        funnel: funnel::assemble(&identity.stages, gating),
    }
}

/// First instant of `date` in `tz`, as UTC.
///
/// Ambiguous midnights resolve to the earlier instant. When midnight falls in
/// a DST gap the day starts an hour later.
pub fn local_midnight_utc(tz: Tz, date: NaiveDate) -> Result<DateTime<Utc>, EngineError> {
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| EngineError::InvalidTimezone(tz.name().to_string()))?;
    let candidates = [midnight, midnight + chrono::Duration::hours(1)];
    for naive in candidates {
        match tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => return Ok(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(a, b) => return Ok(a.min(b).with_timezone(&Utc)),
            LocalResult::None => continue,
        }
    }
    Err(EngineError::InvalidTimezone(tz.name().to_string()))
}

/// `[start, end)` in UTC covering every local day of `window`.
pub fn utc_bounds(
    tz: Tz,
    window: &DateWindow,
) -> Result<(DateTime<Utc>, DateTime<Utc>), EngineError> {
    let after_end = window.end.succ_opt().ok_or(EngineError::InvalidWindow {
        start: window.start,
        end: window.end,
    })?;
    Ok((
        local_midnight_utc(tz, window.start)?,
        local_midnight_utc(tz, after_end)?,
    ))
}

/// One independent reducer over the slice.
#[derive(Debug, Clone, Copy)]
enum Job {
    Identity,
    Channel(usize),
    Sources,
    Campaigns,
    Pages,
    EventTypes,
    Days(DateWindow),
}

enum Partial {
    Identity(IdentitySummary),
    Channel(usize, ActorSet),
    Sources(Tallies<String>),
    Campaigns(Tallies<(String, String, String)>),
    Pages(Tallies<String>),
    EventTypes(Tallies<String>),
    Days(BTreeMap<NaiveDate, DayTally>),
    Skipped,
}

impl Job {
    fn run(self, slice: &[ClassifiedEvent], channels: &[ChannelRule]) -> Partial {
        match self {
            Job::Identity => Partial::Identity(identity::resolve_identities(slice)),
            Job::Channel(idx) => match channels.get(idx) {
                Some(rule) => Partial::Channel(idx, identity::channel_actors(slice, rule)),
                None => Partial::Skipped,
            },
            Job::Sources => Partial::Sources(aggregate::tally_sources(slice)),
            Job::Campaigns => Partial::Campaigns(aggregate::tally_campaigns(slice)),
            Job::Pages => Partial::Pages(aggregate::tally_pages(slice)),
            Job::EventTypes => Partial::EventTypes(aggregate::tally_event_types(slice)),
            Job::Days(window) => Partial::Days(aggregate::tally_days(slice, &window)),
        }
    }
}

struct Parts {
    identity: Option<IdentitySummary>,
    channels: Vec<Option<ActorSet>>,
    sources: Option<Tallies<String>>,
    campaigns: Option<Tallies<(String, String, String)>>,
    pages: Option<Tallies<String>>,
    event_types: Option<Tallies<String>>,
    days: Option<BTreeMap<NaiveDate, DayTally>>,
}

impl Parts {
    fn new(channel_count: usize) -> Self {
        Self {
            identity: None,
            channels: vec![None; channel_count],
            sources: None,
            campaigns: None,
            pages: None,
            event_types: None,
            days: None,
        }
    }

    fn absorb(&mut self, partial: Partial) {
        match partial {
            Partial::Identity(v) => self.identity = Some(v),
            Partial::Channel(idx, v) => {
                if let Some(slot) = self.channels.get_mut(idx) {
                    *slot = Some(v);
                }
            }
            Partial::Sources(v) => self.sources = Some(v),
            Partial::Campaigns(v) => self.campaigns = Some(v),
            Partial::Pages(v) => self.pages = Some(v),
            Partial::EventTypes(v) => self.event_types = Some(v),
            Partial::Days(v) => self.days = Some(v),
            Partial::Skipped => {}
        }
    }
}
