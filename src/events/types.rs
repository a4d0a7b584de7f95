//! Event types shared by every subsystem that records into the event store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An immutable audit record appended to the event store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    /// Store-assigned, strictly increasing position in the log
    pub sequence: u64,
    pub event_type: String,
    /// Natural key of the entity the event is about (deployment, breaker key, instance)
    pub entity_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl SystemEvent {
    /// Read a string field from the payload
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// An event submitted from outside the store, before it has been sequenced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingEvent {
    pub event_type: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl IncomingEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            entity_id: None,
            payload,
        }
    }

    pub fn for_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }
}

/// Selects a subset of events for history queries and subscriptions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Exact event types, or prefixes ending in `.` (e.g. `deployment.`); empty matches all
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types.push(event_type.into());
        self
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn matches(&self, event: &SystemEvent) -> bool {
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(entity) = &self.entity_id {
            if event.entity_id.as_deref() != Some(entity.as_str()) {
                return false;
            }
        }
        self.event_types.is_empty()
            || self.event_types.iter().any(|pattern| {
                if pattern.ends_with('.') {
                    event.event_type.starts_with(pattern.as_str())
                } else {
                    event.event_type == *pattern
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, entity: Option<&str>) -> SystemEvent {
        SystemEvent {
            sequence: 1,
            event_type: event_type.to_string(),
            entity_id: entity.map(str::to_string),
            timestamp: Utc::now(),
            payload: json!({}),
        }
    }

    #[test]
    fn test_filter_matches_prefix_and_entity() {
        let filter = EventFilter::all()
            .with_type("deployment.")
            .with_entity("dep-1");

        assert!(filter.matches(&event("deployment.completed", Some("dep-1"))));
        assert!(!filter.matches(&event("deployment.completed", Some("dep-2"))));
        assert!(!filter.matches(&event("work.queued", Some("dep-1"))));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(EventFilter::all().matches(&event("anything", None)));
    }
}
