//! Dimensional reducers. Each is a single pass over the normalized slice and
//! each skips events lacking its grouping key instead of failing.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use chrono::NaiveDate;

use crate::analytics::{
    CampaignMetric, DateWindow, EventTypeMetric, PageMetric, SourceMetric, TimeBucketMetric,
};
use crate::classify::{FunnelStage, StageClassifier};
use crate::funnel::percentage;
use crate::identity::{ActorSet, SessionSet, StageActorSets};
use crate::slice::ClassifiedEvent;

pub const DIRECT_SOURCE: &str = "direct";
pub const NO_MEDIUM: &str = "none";

/// How many campaigns, in conversion order, are flagged as top performers.
pub const TOP_CAMPAIGNS: usize = 5;
/// A campaign needs more actors than this before it can be underperforming.
pub const UNDERPERFORMING_MIN_ACTORS: usize = 20;
/// Conversion rate (percent) below which a campaign underperforms.
pub const UNDERPERFORMING_MAX_RATE: f64 = 1.0;

/// Raw volume plus distinct actors and sessions for one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupTally {
    pub events: u64,
    pub actors: ActorSet,
    pub sessions: SessionSet,
}

impl GroupTally {
    pub fn record(&mut self, item: &ClassifiedEvent) {
        self.events += 1;
        if let Some(actor) = item.event.actor() {
            if !self.actors.contains(actor) {
                self.actors.insert(actor.to_string());
            }
        }
        if let Some(session) = item.event.session() {
            if !self.sessions.contains(session) {
                self.sessions.insert(session.to_string());
            }
        }
    }

    pub fn converted(&self, converted: &ActorSet) -> usize {
        self.actors.intersection(converted).count()
    }

    /// Converted actors over actors in the group.
    pub fn conversion_rate(&self, converted: &ActorSet) -> f64 {
        percentage(self.converted(converted), self.actors.len())
    }
}

pub type Tallies<K> = HashMap<K, GroupTally>;

/// One day's volume plus who reached which stage that day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DayTally {
    pub volume: GroupTally,
    pub stages: StageActorSets,
}

impl DayTally {
    pub fn record(&mut self, item: &ClassifiedEvent) {
        self.volume.record(item);
        if let (Some(stage), Some(actor)) = (item.stage, item.event.actor()) {
            self.stages.insert(stage, actor);
        }
    }
}

fn tally_by<K, F>(slice: &[ClassifiedEvent], mut key: F) -> Tallies<K>
where
    K: Eq + Hash,
    F: FnMut(&ClassifiedEvent) -> Option<K>,
{
    let mut out: Tallies<K> = HashMap::new();
    for item in slice {
        if let Some(k) = key(item) {
            out.entry(k).or_default().record(item);
        }
    }
    out
}

pub fn tally_sources(slice: &[ClassifiedEvent]) -> Tallies<String> {
    tally_by(slice, |item| {
        Some(item.event.source().unwrap_or(DIRECT_SOURCE).to_string())
    })
}

/// Key is `(campaign, source, medium)`. Events without a campaign are skipped.
pub fn tally_campaigns(slice: &[ClassifiedEvent]) -> Tallies<(String, String, String)> {
    tally_by(slice, |item| {
        let campaign = item.event.campaign()?;
        Some((
            campaign.to_string(),
            item.event.source().unwrap_or(DIRECT_SOURCE).to_string(),
            item.event.medium().unwrap_or(NO_MEDIUM).to_string(),
        ))
    })
}

/// Page views only, keyed by page path.
pub fn tally_pages(slice: &[ClassifiedEvent]) -> Tallies<String> {
    tally_by(slice, |item| {
        if !item.page_view {
            return None;
        }
        item.event.attributes.page_path().map(|path| path.into_owned())
    })
}

/// Keyed by the raw event type as produced, not by stage.
pub fn tally_event_types(slice: &[ClassifiedEvent]) -> Tallies<String> {
    tally_by(slice, |item| Some(item.event.event_type.clone()))
}

/// Every day of `window` is present, including days without events.
pub fn tally_days(
    slice: &[ClassifiedEvent],
    window: &DateWindow,
) -> BTreeMap<NaiveDate, DayTally> {
    let mut out: BTreeMap<NaiveDate, DayTally> = window
        .days()
        .into_iter()
        .map(|d| (d, DayTally::default()))
        .collect();
    for item in slice {
        if let Some(tally) = out.get_mut(&item.day) {
            tally.record(item);
        }
    }
    out
}

pub fn finish_sources(tallies: Tallies<String>, converted: &ActorSet) -> Vec<SourceMetric> {
    let mut rows: Vec<SourceMetric> = tallies
        .into_iter()
        .map(|(source, t)| SourceMetric {
            converted_actors: t.converted(converted),
            conversion_rate: t.conversion_rate(converted),
            source,
            events: t.events,
            actors: t.actors.len(),
            sessions: t.sessions.len(),
        })
        .collect();
    rows.sort_by(|a, b| b.events.cmp(&a.events).then_with(|| a.source.cmp(&b.source)));
    rows
}

pub fn finish_campaigns(
    tallies: Tallies<(String, String, String)>,
    converted: &ActorSet,
) -> Vec<CampaignMetric> {
    let mut rows: Vec<CampaignMetric> = tallies
        .into_iter()
        .map(|((campaign, source, medium), t)| CampaignMetric {
            converted_actors: t.converted(converted),
            conversion_rate: t.conversion_rate(converted),
            campaign,
            source,
            medium,
            events: t.events,
            actors: t.actors.len(),
            sessions: t.sessions.len(),
            top_performer: false,
            underperforming: false,
        })
        .collect();
    rows.sort_by(|a, b| {
        b.converted_actors
            .cmp(&a.converted_actors)
            .then_with(|| b.events.cmp(&a.events))
            .then_with(|| a.campaign.cmp(&b.campaign))
            .then_with(|| a.source.cmp(&b.source))
            .then_with(|| a.medium.cmp(&b.medium))
    });
    flag_campaigns(&mut rows);
    rows
}

/// Mark the leading converters and the well-trafficked campaigns that
/// barely convert. `rows` must already be in conversion order.
fn flag_campaigns(rows: &mut [CampaignMetric]) {
    for (rank, row) in rows.iter_mut().enumerate() {
        row.top_performer = rank < TOP_CAMPAIGNS && row.converted_actors > 0;
        row.underperforming = row.actors > UNDERPERFORMING_MIN_ACTORS
            && row.conversion_rate < UNDERPERFORMING_MAX_RATE;
    }
}

pub fn finish_pages(tallies: Tallies<String>, converted: &ActorSet) -> Vec<PageMetric> {
    let mut rows: Vec<PageMetric> = tallies
        .into_iter()
        .map(|(path, t)| PageMetric {
            converted_actors: t.converted(converted),
            conversion_rate: t.conversion_rate(converted),
            path,
            views: t.events,
            actors: t.actors.len(),
            sessions: t.sessions.len(),
        })
        .collect();
    rows.sort_by(|a, b| b.views.cmp(&a.views).then_with(|| a.path.cmp(&b.path)));
    rows
}

pub fn finish_event_types(
    tallies: Tallies<String>,
    total_events: u64,
    converted: &ActorSet,
) -> Vec<EventTypeMetric> {
    let total = usize::try_from(total_events).unwrap_or(usize::MAX);
    let mut rows: Vec<EventTypeMetric> = tallies
        .into_iter()
        .map(|(event_type, t)| EventTypeMetric {
            stage: StageClassifier::stage_for_type(&event_type),
            share_pct: percentage(usize::try_from(t.events).unwrap_or(usize::MAX), total),
            converted_actors: t.converted(converted),
            conversion_rate: t.conversion_rate(converted),
            event_type,
            events: t.events,
            actors: t.actors.len(),
        })
        .collect();
    rows.sort_by(|a, b| {
        b.events
            .cmp(&a.events)
            .then_with(|| a.event_type.cmp(&b.event_type))
    });
    rows
}

pub fn finish_days(
    tallies: BTreeMap<NaiveDate, DayTally>,
    converted: &ActorSet,
) -> Vec<TimeBucketMetric> {
    tallies
        .into_iter()
        .map(|(date, day)| {
            let counts = day.stages.counts();
            let t = day.volume;
            TimeBucketMetric {
                date,
                events: t.events,
                actors: t.actors.len(),
                sessions: t.sessions.len(),
                converted_actors: t.converted(converted),
                conversion_rate: t.conversion_rate(converted),
                stage_actors: FunnelStage::ALL
                    .iter()
                    .map(|stage| (*stage, counts[stage.index()]))
                    .collect(),
                landing_to_lead_rate: percentage(
                    counts[FunnelStage::LeadComplete.index()],
                    counts[FunnelStage::LandingView.index()],
                ),
            }
        })
        .collect()
}
