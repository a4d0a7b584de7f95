use super::types::{EventFilter, SystemEvent};
use tokio::sync::broadcast;
use tracing::warn;

/// Fan-out of sequenced events to live subscribers
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<SystemEvent>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an already-sequenced event
    pub fn publish(&self, event: SystemEvent) {
        // No subscribers is fine; the store keeps the history
        let _ = self.sender.send(event);
    }

    /// Subscribe to events that match `filter`
    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(crate::constants::system::DEFAULT_EVENT_CHANNEL_CAPACITY)
    }
}

/// Typed, filtered view over the live event stream
#[derive(Debug)]
pub struct EventSubscription {
    receiver: broadcast::Receiver<SystemEvent>,
    filter: EventFilter,
}

impl EventSubscription {
    /// Next matching event, or `None` once the store is dropped
    ///
    /// A subscriber that falls behind the channel capacity skips ahead; the
    /// skipped events remain available through history queries.
    pub async fn recv(&mut self) -> Option<SystemEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "⚠️ Event subscriber lagged behind");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<SystemEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }
}
