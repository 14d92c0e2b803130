use anyhow::Result;
use tokio::sync::RwLock;

use crate::analytics::{EventSource, FetchRequest};
use crate::event::TrackingEvent;

/// Event source backed by a vector. Applies the window and filters the same
/// way a storage adapter would.
#[derive(Debug, Default)]
pub struct InMemoryEventSource {
    events: RwLock<Vec<TrackingEvent>>,
}

impl InMemoryEventSource {
    pub fn new(events: Vec<TrackingEvent>) -> Self {
        Self {
            events: RwLock::new(events),
        }
    }

    pub async fn push(&self, events: impl IntoIterator<Item = TrackingEvent>) {
        self.events.write().await.extend(events);
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl EventSource for InMemoryEventSource {
    async fn fetch_events(&self, request: &FetchRequest) -> Result<Vec<TrackingEvent>> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| e.occurred_at >= request.start && e.occurred_at < request.end)
            .filter(|e| request.filter.matches(e))
            .cloned()
            .collect())
    }
}
