use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

use crate::analytics::FunnelFilter;
use crate::classify::{FunnelStage, StageClassifier};
use crate::event::TrackingEvent;

/// A fetched event with everything the reducers derive from it computed once.
#[derive(Debug, Clone)]
pub struct ClassifiedEvent {
    pub event: TrackingEvent,
    pub stage: Option<FunnelStage>,
    pub page_view: bool,
    /// Calendar day of `occurred_at` in the reporting timezone.
    pub day: NaiveDate,
}

/// Turn a fetched batch into the slice every reducer reads.
///
/// The window and filters are re-applied here so an adapter that filters
/// loosely (or not at all) cannot skew the totals.
pub fn normalize(
    events: Vec<TrackingEvent>,
    start_utc: DateTime<Utc>,
    end_utc: DateTime<Utc>,
    filter: &FunnelFilter,
    tz: Tz,
    classifier: &StageClassifier,
) -> Vec<ClassifiedEvent> {
    events
        .into_iter()
        .filter(|e| e.occurred_at >= start_utc && e.occurred_at < end_utc)
        .filter(|e| filter.matches(e))
        .map(|event| {
            let stage = classifier.classify(&event);
            let page_view = classifier.is_page_view(&event);
            let day = event.occurred_at.with_timezone(&tz).date_naive();
            ClassifiedEvent {
                event,
                stage,
                page_view,
                day,
            }
        })
        .collect()
}
