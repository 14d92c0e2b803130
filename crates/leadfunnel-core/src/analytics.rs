//! Query types, result types and the event-source abstraction.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::FunnelStage;
use crate::event::TrackingEvent;

/// Inclusive calendar-date window in the reporting timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    /// Every calendar day of the window, ascending. Empty when invalid.
    pub fn days(&self) -> Vec<NaiveDate> {
        if !self.is_valid() {
            return Vec::new();
        }
        self.start.iter_days().take_while(|d| *d <= self.end).collect()
    }

    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

/// Optional exact-match attribution filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunnelFilter {
    pub utm_source: Option<String>,
    pub utm_campaign: Option<String>,
}

impl FunnelFilter {
    pub fn matches(&self, event: &TrackingEvent) -> bool {
        if let Some(ref source) = self.utm_source {
            if event.source() != Some(source.trim()) {
                return false;
            }
        }
        if let Some(ref campaign) = self.utm_campaign {
            if event.campaign() != Some(campaign.trim()) {
                return false;
            }
        }
        true
    }
}

/// Whether stage N requires the actor to have reached stage N-1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelGating {
    /// Raw distinct-actor counts per stage, as observed.
    #[default]
    Independent,
    /// Each stage is intersected with the previous gated stage.
    Sequential,
}

impl FunnelGating {
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        match raw.map(str::trim) {
            None | Some("") | Some("independent") => Ok(Self::Independent),
            Some("sequential") => Ok(Self::Sequential),
            Some(_) => Err(anyhow!("gating must be one of: independent, sequential")),
        }
    }
}

/// One `compute_funnel` request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunnelQuery {
    pub window: DateWindow,
    #[serde(default)]
    pub filter: FunnelFilter,
    /// IANA name; the engine's default applies when `None`.
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub gating: FunnelGating,
}

impl FunnelQuery {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            window: DateWindow::new(start, end),
            filter: FunnelFilter::default(),
            timezone: None,
            gating: FunnelGating::default(),
        }
    }
}

/// What the engine asks an [`EventSource`] for: the UTC expansion of the
/// window (`start` inclusive, `end` exclusive) plus the filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub filter: FunnelFilter,
}

/// The only seam between the engine and storage.
///
/// Implementations should filter server-side when they can. A transport or
/// decode failure must be returned as `Err`; an empty `Vec` means no events.
/// Implementations do not retry.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync + 'static {
    async fn fetch_events(&self, request: &FetchRequest) -> Result<Vec<TrackingEvent>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCount {
    pub stage: FunnelStage,
    pub label: String,
    pub actors: usize,
    /// Sorted for stable output; membership is what matters.
    pub actor_ids: Vec<String>,
    pub stage_to_stage_rate: f64,
    pub percent_of_first: f64,
    pub drop_off_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelSnapshot {
    pub gating: FunnelGating,
    pub stages: Vec<StageCount>,
    pub overall_rate: f64,
}

impl FunnelSnapshot {
    pub fn stage(&self, stage: FunnelStage) -> Option<&StageCount> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFunnel {
    pub channel: String,
    /// Distinct actors with at least one event attributed to the channel.
    pub channel_actors: usize,
    pub funnel: FunnelSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetric {
    pub source: String,
    pub events: u64,
    pub actors: usize,
    pub sessions: usize,
    pub converted_actors: usize,
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignMetric {
    pub campaign: String,
    pub source: String,
    pub medium: String,
    pub events: u64,
    pub actors: usize,
    pub sessions: usize,
    pub converted_actors: usize,
    pub conversion_rate: f64,
    /// Among the leading campaigns by conversions.
    pub top_performer: bool,
    /// Enough traffic to judge, but converting below the floor.
    pub underperforming: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageMetric {
    pub path: String,
    pub views: u64,
    pub actors: usize,
    pub sessions: usize,
    pub converted_actors: usize,
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTypeMetric {
    pub event_type: String,
    pub stage: Option<FunnelStage>,
    pub events: u64,
    pub actors: usize,
    /// Share of all events in the slice.
    pub share_pct: f64,
    pub converted_actors: usize,
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeBucketMetric {
    pub date: NaiveDate,
    pub events: u64,
    pub actors: usize,
    pub sessions: usize,
    pub converted_actors: usize,
    pub conversion_rate: f64,
    /// Distinct actors reaching each stage on this day. Every stage is present.
    pub stage_actors: BTreeMap<FunnelStage, usize>,
    /// Same-day lead actors over same-day landing actors.
    pub landing_to_lead_rate: f64,
}

/// Projected daily volume past the end of the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub date: NaiveDate,
    pub landing_actors: u64,
    pub lead_actors: u64,
    /// Heuristic confidence in percent; decays with distance from the data.
    pub confidence: f64,
}

/// Complete output of one `compute_funnel` call. Always fully populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelResponse {
    pub window: DateWindow,
    pub timezone: String,
    pub filter: FunnelFilter,
    pub total_events: u64,
    pub total_actors: usize,
    pub total_sessions: usize,
    pub funnel: FunnelSnapshot,
    pub channel_funnels: Vec<ChannelFunnel>,
    pub sources: Vec<SourceMetric>,
    pub campaigns: Vec<CampaignMetric>,
    pub pages: Vec<PageMetric>,
    pub event_types: Vec<EventTypeMetric>,
    pub timeseries: Vec<TimeBucketMetric>,
    /// Empty when the window is too short to fit a trend.
    pub forecast: Vec<ForecastPoint>,
}

/// Trailing-window rollups ending on a given day. Window, filters and gating
/// are fixed by the engine; only the attribution filter, timezone and gating
/// come from the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RollupQuery {
    #[serde(default)]
    pub filter: FunnelFilter,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub gating: FunnelGating,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupWindow {
    pub window: DateWindow,
    pub total_events: u64,
    pub total_actors: usize,
    pub funnel: FunnelSnapshot,
}

/// Funnel totals for the trailing day pair, week and month ending `as_of`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelRollups {
    pub as_of: NaiveDate,
    pub timezone: String,
    pub filter: FunnelFilter,
    /// Yesterday and today, the calendar reading of "last 24 hours".
    pub last_24h: RollupWindow,
    pub last_7d: RollupWindow,
    pub last_30d: RollupWindow,
}
