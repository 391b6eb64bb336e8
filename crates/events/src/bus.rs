//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the publish/subscribe hub for [`DomainEvent`]s. It is
//! shared via `Arc<EventBus>` between the publishers (CRM integration, the
//! engine facade) and the event-trigger listener.

use cadence_core::types::{DbId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// DomainEvent
// ---------------------------------------------------------------------------

/// Something that happened to a subject in the CRM, e.g. `contact_created`,
/// `purchase_completed`, `lead_status_changed`.
///
/// Constructed via [`DomainEvent::new`] and enriched with
/// [`for_subject`](DomainEvent::for_subject) and
/// [`with_payload`](DomainEvent::with_payload).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique event id; the occurrence key of every firing it causes.
    pub id: String,

    pub tenant_id: DbId,

    /// Event name matched against `Trigger::Event::event_name`.
    pub name: String,

    /// The subject the event is about. Events without one cannot enroll.
    pub subject_id: Option<DbId>,

    /// Free-form JSON payload matched against trigger filters.
    pub payload: serde_json::Value,

    pub occurred_at: Timestamp,
}

impl DomainEvent {
    /// Create an event with a fresh time-ordered id and an empty payload.
    pub fn new(tenant_id: DbId, name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            tenant_id,
            name: name.into(),
            subject_id: None,
            payload: serde_json::Value::Object(Default::default()),
            occurred_at: Utc::now(),
        }
    }

    pub fn for_subject(mut self, subject_id: DbId) -> Self {
        self.subject_id = Some(subject_id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Use an id assigned upstream, so redelivered events stay idempotent.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn at(mut self, occurred_at: Timestamp) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// # Usage
///
/// ```rust
/// use cadence_events::bus::{DomainEvent, EventBus};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(DomainEvent::new(1, "contact_created").for_subject(42));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers. Returns the number of
    /// subscribers that will see it.
    pub fn publish(&self, event: DomainEvent) -> usize {
        // A SendError only means there are zero receivers.
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
