//! # Event Store
//!
//! Append-only, timestamp-ordered audit log shared by every subsystem.
//!
//! Appends are serialized under one write lock so that sequence numbers,
//! timestamps and live delivery order all agree. Events are never mutated or
//! removed once appended.

use super::publisher::{EventPublisher, EventSubscription};
use super::types::{EventFilter, IncomingEvent, SystemEvent};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Default)]
struct EventLog {
    events: Vec<SystemEvent>,
    /// Positions in `events` per entity id
    by_entity: HashMap<String, Vec<usize>>,
}

/// Cheaply cloneable handle to the shared event log
#[derive(Debug, Clone)]
pub struct EventStore {
    log: Arc<RwLock<EventLog>>,
    publisher: EventPublisher,
}

impl EventStore {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            log: Arc::new(RwLock::new(EventLog::default())),
            publisher: EventPublisher::new(channel_capacity),
        }
    }

    /// Append an event and deliver it to matching subscribers
    pub fn append(
        &self,
        event_type: impl Into<String>,
        entity_id: Option<&str>,
        payload: Value,
    ) -> SystemEvent {
        let mut log = self.log.write();

        let now = Utc::now();
        // Wall clocks can step backwards; the log must not
        let timestamp = match log.events.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };

        let event = SystemEvent {
            sequence: log.events.len() as u64 + 1,
            event_type: event_type.into(),
            entity_id: entity_id.map(str::to_string),
            timestamp,
            payload,
        };

        let position = log.events.len();
        if let Some(entity) = &event.entity_id {
            log.by_entity
                .entry(entity.clone())
                .or_default()
                .push(position);
        }
        log.events.push(event.clone());

        trace!(
            sequence = event.sequence,
            event_type = %event.event_type,
            entity_id = ?event.entity_id,
            "Event appended"
        );

        // Published under the lock so live order matches sequence order
        self.publisher.publish(event.clone());
        event
    }

    /// Append an event received from another subsystem or collaborator
    pub fn append_incoming(&self, incoming: IncomingEvent) -> SystemEvent {
        self.append(
            incoming.event_type,
            incoming.entity_id.as_deref(),
            incoming.payload,
        )
    }

    /// All events at or after `since`, in append order
    pub fn get_history(&self, since: Option<DateTime<Utc>>) -> Vec<SystemEvent> {
        let log = self.log.read();
        match since {
            None => log.events.clone(),
            Some(since) => {
                // Timestamps are non-decreasing, so binary search is valid
                let start = log.events.partition_point(|e| e.timestamp < since);
                log.events[start..].to_vec()
            }
        }
    }

    /// Events matching `filter`, in append order
    pub fn query(&self, filter: &EventFilter) -> Vec<SystemEvent> {
        let log = self.log.read();
        match &filter.entity_id {
            Some(entity) => log
                .by_entity
                .get(entity)
                .map(|positions| {
                    positions
                        .iter()
                        .map(|&i| &log.events[i])
                        .filter(|e| filter.matches(e))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            None => log
                .events
                .iter()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect(),
        }
    }

    /// Events recorded for one entity, in the order they were applied
    pub fn events_for_entity(&self, entity_id: &str) -> Vec<SystemEvent> {
        self.query(&EventFilter::all().with_entity(entity_id))
    }

    /// Subscribe to future events matching `filter`
    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        self.publisher.subscribe(filter)
    }

    pub fn len(&self) -> usize {
        self.log.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence number of the latest event, 0 when empty
    pub fn latest_sequence(&self) -> u64 {
        self.log.read().events.len() as u64
    }

    pub fn subscriber_count(&self) -> usize {
        self.publisher.subscriber_count()
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(crate::constants::system::DEFAULT_EVENT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::events;
    use serde_json::json;

    #[test]
    fn test_append_assigns_increasing_sequence_and_timestamps() {
        let store = EventStore::default();
        let first = store.append(events::WORK_QUEUED, Some("req-1"), json!({}));
        let second = store.append(events::WORK_STARTED, Some("req-1"), json!({}));

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert!(second.timestamp >= first.timestamp);
        assert_eq!(store.len(), 2);
        assert_eq!(store.latest_sequence(), 2);
    }

    #[test]
    fn test_history_since_point_in_time() {
        let store = EventStore::default();
        store.append(events::WORK_QUEUED, None, json!({}));
        let marker = store.append(events::WORK_STARTED, None, json!({}));
        store.append(events::WORK_COMPLETED, None, json!({}));

        let history = store.get_history(Some(marker.timestamp));
        assert!(history.iter().all(|e| e.timestamp >= marker.timestamp));
        assert!(history.iter().any(|e| e.event_type == events::WORK_COMPLETED));
        assert_eq!(store.get_history(None).len(), 3);
    }

    #[test]
    fn test_entity_queries_preserve_order() {
        let store = EventStore::default();
        store.append(events::DEPLOYMENT_CREATED, Some("dep-1"), json!({}));
        store.append(events::DEPLOYMENT_CREATED, Some("dep-2"), json!({}));
        store.append(events::DEPLOYMENT_COMPLETED, Some("dep-1"), json!({}));

        let dep1 = store.events_for_entity("dep-1");
        assert_eq!(dep1.len(), 2);
        assert_eq!(dep1[0].event_type, events::DEPLOYMENT_CREATED);
        assert_eq!(dep1[1].event_type, events::DEPLOYMENT_COMPLETED);

        let completed = store.query(
            &EventFilter::all()
                .with_entity("dep-1")
                .with_type(events::DEPLOYMENT_COMPLETED),
        );
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test]
    async fn test_filtered_subscription_receives_matching_events() {
        let store = EventStore::default();
        let mut subscription = store.subscribe(EventFilter::all().with_type("scaling."));

        store.append(events::WORK_QUEUED, None, json!({}));
        store.append(events::SCALING_SCALED_UP, Some("api"), json!({"to": 4}));

        let received = subscription.recv().await.unwrap();
        assert_eq!(received.event_type, events::SCALING_SCALED_UP);
        assert_eq!(received.payload["to"], 4);
    }
}
