use crate::analytics::{ChannelFunnel, FunnelGating, FunnelSnapshot, StageCount};
use crate::classify::FunnelStage;
use crate::identity::{ActorSet, StageActorSets};

/// `num / den` as a percentage rounded to one decimal, clamped to `[0, 100]`.
///
/// Returns exactly `0.0` when `den` is zero.
pub fn percentage(num: usize, den: usize) -> f64 {
    if den == 0 {
        return 0.0;
    }
    let raw = num as f64 / den as f64 * 100.0;
    ((raw * 10.0).round() / 10.0).clamp(0.0, 100.0)
}

/// Apply the funnel gating policy to raw per-stage sets.
///
/// `Sequential` keeps an actor at stage N only if they also survived stage
/// N-1. `Independent` returns the observed sets unchanged.
pub fn apply_gating(stages: &StageActorSets, gating: FunnelGating) -> StageActorSets {
    match gating {
        FunnelGating::Independent => stages.clone(),
        FunnelGating::Sequential => {
            let mut gated = StageActorSets::default();
            let mut previous: Option<ActorSet> = None;
            for stage in FunnelStage::ALL {
                let current: ActorSet = match &previous {
                    None => stages.get(stage).clone(),
                    Some(prev) => stages.get(stage).intersection(prev).cloned().collect(),
                };
                gated.set(stage, current.clone());
                previous = Some(current);
            }
            gated
        }
    }
}

/// Assemble the ordered funnel and its rates from (already gated) stage sets.
pub fn snapshot_from_sets(stages: &StageActorSets, gating: FunnelGating) -> FunnelSnapshot {
    let counts = stages.counts();
    let first = counts[0];
    let mut rows = Vec::with_capacity(FunnelStage::COUNT);

    for stage in FunnelStage::ALL {
        let idx = stage.index();
        let actors = counts[idx];
        let (stage_to_stage_rate, drop_off_rate) = if idx == 0 {
            (if actors > 0 { 100.0 } else { 0.0 }, 0.0)
        } else {
            let previous = counts[idx - 1];
            let rate = percentage(actors, previous);
            let drop = if previous > 0 {
                ((100.0 - rate) * 10.0).round() / 10.0
            } else {
                0.0
            };
            (rate, drop)
        };

        let mut actor_ids: Vec<String> = stages.get(stage).iter().cloned().collect();
        actor_ids.sort();

        rows.push(StageCount {
            stage,
            label: stage.label().to_string(),
            actors,
            actor_ids,
            stage_to_stage_rate,
            percent_of_first: percentage(actors, first),
            drop_off_rate,
        });
    }

    FunnelSnapshot {
        gating,
        overall_rate: percentage(counts[FunnelStage::COUNT - 1], first),
        stages: rows,
    }
}

/// Gate and assemble in one step.
pub fn assemble(stages: &StageActorSets, gating: FunnelGating) -> FunnelSnapshot {
    snapshot_from_sets(&apply_gating(stages, gating), gating)
}

/// Sub-funnel for one channel: every raw stage set intersected with the
/// channel's actors, then gated and assembled like the parent funnel.
pub fn channel_funnel(
    channel: &str,
    stages: &StageActorSets,
    channel_actors: &ActorSet,
    gating: FunnelGating,
) -> ChannelFunnel {
    let restricted = stages.intersect(channel_actors);
    ChannelFunnel {
        channel: channel.to_string(),
        channel_actors: channel_actors.len(),
        funnel: assemble(&restricted, gating),
    }
}
