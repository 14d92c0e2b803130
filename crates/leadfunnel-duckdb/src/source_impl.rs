use anyhow::Result;
use async_trait::async_trait;

use leadfunnel_core::analytics::{EventSource, FetchRequest};
use leadfunnel_core::event::TrackingEvent;

use crate::events::fetch_events_inner;
use crate::DuckDbEventStore;

#[async_trait]
impl EventSource for DuckDbEventStore {
    async fn fetch_events(&self, request: &FetchRequest) -> Result<Vec<TrackingEvent>> {
        fetch_events_inner(self, request).await
    }
}
