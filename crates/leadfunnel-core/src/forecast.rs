//! Straight-line projection of the daily series.
//!
//! Deliberately naive: an ordinary least-squares line through each series,
//! evaluated past the last day and floored at zero.

use crate::analytics::{ForecastPoint, TimeBucketMetric};
use crate::classify::FunnelStage;

/// Fewer observed days than this yields no forecast.
pub const MIN_HISTORY_DAYS: usize = 7;

const MAX_CONFIDENCE: f64 = 95.0;
const MIN_CONFIDENCE: f64 = 50.0;
const CONFIDENCE_DECAY_PER_DAY: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trend {
    pub slope: f64,
    pub intercept: f64,
}

impl Trend {
    pub fn at(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Least-squares line through `(i, values[i])`. `None` with fewer than two
/// points.
pub fn linear_trend(values: &[f64]) -> Option<Trend> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let n_f = n as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0.0, 0.0, 0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let x = i as f64;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_x2 += x * x;
    }
    let denominator = n_f * sum_x2 - sum_x * sum_x;
    if denominator == 0.0 {
        return None;
    }
    let slope = (n_f * sum_xy - sum_x * sum_y) / denominator;
    Some(Trend {
        slope,
        intercept: (sum_y - slope * sum_x) / n_f,
    })
}

fn stage_series(timeseries: &[TimeBucketMetric], stage: FunnelStage) -> Vec<f64> {
    timeseries
        .iter()
        .map(|day| day.stage_actors.get(&stage).copied().unwrap_or(0) as f64)
        .collect()
}

fn project(trend: &Trend, x: f64) -> u64 {
    trend.at(x).round().max(0.0) as u64
}

/// Project landing and lead actors for `horizon_days` past the last bucket.
///
/// `timeseries` must be ascending and gap-free, which the time-bucket
/// reducer guarantees.
pub fn forecast(timeseries: &[TimeBucketMetric], horizon_days: u32) -> Vec<ForecastPoint> {
    if timeseries.len() < MIN_HISTORY_DAYS || horizon_days == 0 {
        return Vec::new();
    }
    let Some(last) = timeseries.last() else {
        return Vec::new();
    };
    let landing = linear_trend(&stage_series(timeseries, FunnelStage::LandingView));
    let leads = linear_trend(&stage_series(timeseries, FunnelStage::LeadComplete));
    let (Some(landing), Some(leads)) = (landing, leads) else {
        return Vec::new();
    };

    let last_x = (timeseries.len() - 1) as f64;
    (1..=horizon_days)
        .map_while(|ahead| {
            let date = last.date.checked_add_days(chrono::Days::new(u64::from(ahead)))?;
            let x = last_x + f64::from(ahead);
            Some(ForecastPoint {
                date,
                landing_actors: project(&landing, x),
                lead_actors: project(&leads, x),
                confidence: (MAX_CONFIDENCE - CONFIDENCE_DECAY_PER_DAY * f64::from(ahead))
                    .max(MIN_CONFIDENCE),
            })
        })
        .collect()
}
