//! Default event publisher - in-process broadcast fan-out
//!
//! Publishes engine events on a `tokio::sync::broadcast` channel. Slow
//! subscribers lag rather than block the engine, matching the fire-and-
//! forget contract of lifecycle events.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::Result;
use crate::event::ProcessEvent;
use crate::ports::EventPublisher;

/// Broadcast-channel event publisher
#[derive(Clone)]
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<ProcessEvent>,
}

impl BroadcastEventPublisher {
    /// Create a publisher with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to published events
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, event: ProcessEvent) -> Result<()> {
        // a send error only means nobody is subscribed
        if self.sender.send(event.clone()).is_err() {
            debug!(event_type = %event.event_type, "no subscribers for event");
        }
        Ok(())
    }

    fn publish_async(&self, event: ProcessEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::lifecycle;
    use serde_json::Map;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let publisher = BroadcastEventPublisher::new(8);
        let mut rx = publisher.subscribe();

        publisher
            .publish(ProcessEvent::from_system(lifecycle::PROCESS_STARTED, Map::new()))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, lifecycle::PROCESS_STARTED);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_not_an_error() {
        let publisher = BroadcastEventPublisher::new(8);
        publisher
            .publish(ProcessEvent::from_system(lifecycle::NODE_EXECUTED, Map::new()))
            .await
            .unwrap();
    }
}
