//! # Events
//!
//! The shared audit log and its typed subscription stream. Every subsystem holds
//! an [`EventStore`] handle and records its state changes there; consumers either
//! query history or subscribe with an [`EventFilter`].

pub mod publisher;
pub mod store;
pub mod types;

pub use publisher::{EventPublisher, EventSubscription};
pub use store::EventStore;
pub use types::{EventFilter, IncomingEvent, SystemEvent};
