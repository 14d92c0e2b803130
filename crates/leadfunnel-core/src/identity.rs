use std::collections::HashSet;

use crate::attribution::{is_paid_channel, ChannelRule};
use crate::classify::FunnelStage;
use crate::slice::ClassifiedEvent;

/// Distinct actor identifiers. Order is never meaningful.
pub type ActorSet = HashSet<String>;

/// Distinct session identifiers.
pub type SessionSet = HashSet<String>;

/// One actor set per funnel stage, indexed by [`FunnelStage::index`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageActorSets([ActorSet; FunnelStage::COUNT]);

impl StageActorSets {
    pub fn get(&self, stage: FunnelStage) -> &ActorSet {
        &self.0[stage.index()]
    }

    pub fn insert(&mut self, stage: FunnelStage, actor: &str) {
        let set = &mut self.0[stage.index()];
        if !set.contains(actor) {
            set.insert(actor.to_string());
        }
    }

    pub fn set(&mut self, stage: FunnelStage, actors: ActorSet) {
        self.0[stage.index()] = actors;
    }

    /// Restrict every stage to actors also present in `actors`.
    pub fn intersect(&self, actors: &ActorSet) -> Self {
        let mut out = Self::default();
        for stage in FunnelStage::ALL {
            out.set(
                stage,
                self.get(stage).intersection(actors).cloned().collect(),
            );
        }
        out
    }

    pub fn counts(&self) -> [usize; FunnelStage::COUNT] {
        let mut counts = [0; FunnelStage::COUNT];
        for stage in FunnelStage::ALL {
            counts[stage.index()] = self.get(stage).len();
        }
        counts
    }
}

/// Output of one pass of the identity resolver over a slice.
#[derive(Debug, Clone, Default)]
pub struct IdentitySummary {
    pub stages: StageActorSets,
    /// Every identified actor in the slice, staged or not.
    pub actors: ActorSet,
    pub sessions: SessionSet,
}

/// Actors that produced at least one event qualifying for `stage`.
///
/// Anonymous events never contribute.
pub fn resolve_stage_actors(slice: &[ClassifiedEvent], stage: FunnelStage) -> ActorSet {
    slice
        .iter()
        .filter(|e| e.stage == Some(stage))
        .filter_map(|e| e.event.actor())
        .map(str::to_string)
        .collect()
}

/// Resolve every stage set plus the overall actor and session sets in one pass.
pub fn resolve_identities<'a, I>(slice: I) -> IdentitySummary
where
    I: IntoIterator<Item = &'a ClassifiedEvent>,
{
    let mut summary = IdentitySummary::default();
    for item in slice {
        if let Some(session) = item.event.session() {
            if !summary.sessions.contains(session) {
                summary.sessions.insert(session.to_string());
            }
        }
        let Some(actor) = item.event.actor() else {
            continue;
        };
        if !summary.actors.contains(actor) {
            summary.actors.insert(actor.to_string());
        }
        if let Some(stage) = item.stage {
            summary.stages.insert(stage, actor);
        }
    }
    summary
}

/// Actors with at least one event attributed to `rule`'s channel.
pub fn channel_actors(slice: &[ClassifiedEvent], rule: &ChannelRule) -> ActorSet {
    slice
        .iter()
        .filter(|e| is_paid_channel(&e.event, rule))
        .filter_map(|e| e.event.actor())
        .map(str::to_string)
        .collect()
}
