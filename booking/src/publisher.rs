//! Sealing and publishing domain events.

use crate::error::BookingError;
use crate::events::Routed;
use chrono::{DateTime, Utc};
use fieldbook_core::event::{EventEnvelope, EventId};
use fieldbook_core::event_bus::{EventBus, EventBusError};
use fieldbook_runtime::RetryPolicy;
use fieldbook_runtime::retry::retry_with_predicate;
use std::sync::Arc;

/// A sealed event and the topic it goes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outgoing {
    /// Destination topic
    pub topic: &'static str,
    /// Sealed envelope
    pub envelope: EventEnvelope,
}

impl Outgoing {
    /// Seal `event` for its topic, keyed by its partition key.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Fatal`] if the event cannot be encoded.
    pub fn seal<E: Routed>(
        event_id: EventId,
        event: &E,
        occurred_at: DateTime<Utc>,
        cause: Option<EventId>,
    ) -> Result<Self, BookingError> {
        Ok(Self {
            topic: E::TOPIC,
            envelope: EventEnvelope::seal(event_id, event.key(), event, occurred_at, cause)?,
        })
    }
}

/// Publishes sealed events, retrying transient bus failures.
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn EventBus>,
    retry: RetryPolicy,
}

impl Publisher {
    /// Create a publisher on `bus`.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, retry: RetryPolicy) -> Self {
        Self { bus, retry }
    }

    /// Publish one event.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Transient`] once retries are exhausted.
    pub async fn publish(&self, outgoing: &Outgoing) -> Result<(), BookingError> {
        retry_with_predicate(
            &self.retry,
            || self.bus.publish(outgoing.topic, &outgoing.envelope),
            EventBusError::is_transient,
        )
        .await
        .map_err(|e| {
            tracing::warn!(
                topic = outgoing.topic,
                event_type = %outgoing.envelope.event_type,
                event_id = %outgoing.envelope.event_id,
                error = %e,
                "Publish failed"
            );
            BookingError::from(e)
        })
    }

    /// Publish events in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first publish error; later events are not attempted.
    pub async fn publish_all(&self, outgoing: &[Outgoing]) -> Result<(), BookingError> {
        for event in outgoing {
            self.publish(event).await?;
        }
        Ok(())
    }
}
