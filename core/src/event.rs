//! Event trait and the envelope that carries events across the bus.
//!
//! Every cross-service fact is a typed event (implementing [`Event`]) sealed
//! into an [`EventEnvelope`] before it is published. The envelope carries what
//! the transport and the consumers need without decoding the payload:
//!
//! - `event_id`: identity used for deduplication under at-least-once delivery
//! - `event_type`: stable versioned name (`"SlotHeld.v1"`) used for routing
//! - `key`: partition key; envelopes sharing a key are delivered in order
//! - `payload`: bincode encoding of the typed event
//!
//! # Deterministic identifiers
//!
//! An event emitted *because of* another event gets an id derived from the
//! cause ([`EventId::derive`]). Reprocessing the same inbound event after a
//! crash therefore re-emits byte-identical ids, and downstream consumers drop
//! the duplicates through their inbox.
//!
//! # Example
//!
//! ```
//! use fieldbook_core::event::{Event, EventEnvelope, EventId};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
//! struct SlotFreed {
//!     slot_id: String,
//! }
//!
//! impl Event for SlotFreed {
//!     fn event_type(&self) -> &'static str {
//!         "SlotFreed.v1"
//!     }
//! }
//!
//! let event = SlotFreed { slot_id: "slot-1".into() };
//! let envelope = EventEnvelope::seal(EventId::new(), "slot-1", &event, chrono::Utc::now(), None)?;
//! assert_eq!(envelope.open::<SlotFreed>()?, event);
//! # Ok::<(), fieldbook_core::event::EventError>(())
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error types for event operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// Unknown event type encountered during deserialization.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

/// An immutable fact published on the event bus.
///
/// The `event_type()` string must be stable and versioned (`"PaymentFailed.v1"`);
/// it is stored alongside the payload and used to pick the decoder.
pub trait Event: Send + Sync + 'static {
    /// Returns the event type identifier for this event.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the bytes are corrupted or
    /// belong to a different schema.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// Unique identifier of a published event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Create a new random event id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derive the id of an event caused by `cause`.
    ///
    /// The same `(cause, discriminator)` pair always yields the same id, so an
    /// event re-emitted during replay collapses with the original downstream.
    /// Use a distinct discriminator per event emitted from one cause.
    #[must_use]
    pub fn derive(cause: EventId, discriminator: &str) -> Self {
        Self(Uuid::new_v5(&cause.0, discriminator.as_bytes()))
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire format of every message on the event bus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Identity used for deduplication.
    pub event_id: EventId,

    /// The event type identifier (e.g., `"SlotHeld.v1"`).
    pub event_type: String,

    /// Partition key. Envelopes with equal keys keep their publish order.
    pub key: String,

    /// The bincode-serialized event.
    pub payload: Vec<u8>,

    /// When the event was produced, by the producer's clock.
    pub occurred_at: DateTime<Utc>,

    /// The event that caused this one, if any.
    pub causation_id: Option<EventId>,
}

impl EventEnvelope {
    /// Serialize `event` into a new envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the event cannot be encoded.
    pub fn seal<E>(
        event_id: EventId,
        key: impl Into<String>,
        event: &E,
        occurred_at: DateTime<Utc>,
        causation_id: Option<EventId>,
    ) -> Result<Self, EventError>
    where
        E: Event + Serialize,
    {
        Ok(Self {
            event_id,
            event_type: event.event_type().to_string(),
            key: key.into(),
            payload: event.to_bytes()?,
            occurred_at,
            causation_id,
        })
    }

    /// Decode the payload as `E`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the payload is not a valid `E`.
    pub fn open<E>(&self) -> Result<E, EventError>
    where
        E: Event + DeserializeOwned,
    {
        E::from_bytes(&self.payload)
    }

    /// Encode the whole envelope for transports that carry opaque bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EventError> {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Decode an envelope produced by [`EventEnvelope::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the bytes are not an envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    enum FieldEvent {
        Opened { field: String },
        Closed { field: String, reason: String },
    }

    impl Event for FieldEvent {
        fn event_type(&self) -> &'static str {
            match self {
                Self::Opened { .. } => "FieldOpened.v1",
                Self::Closed { .. } => "FieldClosed.v1",
            }
        }
    }

    #[test]
    fn derived_ids_are_stable_per_cause_and_discriminator() {
        let cause = EventId::new();

        assert_eq!(EventId::derive(cause, "a"), EventId::derive(cause, "a"));
        assert_ne!(EventId::derive(cause, "a"), EventId::derive(cause, "b"));
        assert_ne!(EventId::derive(cause, "a"), EventId::derive(EventId::new(), "a"));
    }

    proptest::proptest! {
        #[test]
        fn distinct_discriminators_derive_distinct_ids(a in "[a-z]{1,12}", b in "[a-z]{1,12}") {
            let cause = EventId::new();
            proptest::prop_assert_eq!(a == b, EventId::derive(cause, &a) == EventId::derive(cause, &b));
        }
    }

    #[test]
    fn seal_records_type_and_key() {
        let event = FieldEvent::Closed {
            field: "north".into(),
            reason: "rain".into(),
        };
        let cause = EventId::new();
        let envelope =
            EventEnvelope::seal(EventId::new(), "north", &event, Utc::now(), Some(cause)).unwrap();

        assert_eq!(envelope.event_type, "FieldClosed.v1");
        assert_eq!(envelope.key, "north");
        assert_eq!(envelope.causation_id, Some(cause));
        assert_eq!(envelope.open::<FieldEvent>().unwrap(), event);
    }

    #[test]
    fn envelope_survives_transport_encoding() {
        let event = FieldEvent::Opened { field: "south".into() };
        let envelope = EventEnvelope::seal(EventId::new(), "south", &event, Utc::now(), None).unwrap();

        let decoded = EventEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn garbage_payload_is_a_deserialization_error() {
        let envelope = EventEnvelope {
            event_id: EventId::new(),
            event_type: "FieldOpened.v1".into(),
            key: "k".into(),
            payload: vec![0xff; 3],
            occurred_at: Utc::now(),
            causation_id: None,
        };

        assert!(matches!(
            envelope.open::<FieldEvent>(),
            Err(EventError::DeserializationError(_))
        ));
    }
}
