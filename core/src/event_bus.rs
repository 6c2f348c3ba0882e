//! Event bus abstraction for cross-service communication.
//!
//! Services never call each other to change state. They publish
//! [`EventEnvelope`]s to topics and consume the topics they care about:
//!
//! ```text
//! Order Service ──SlotHoldRequested──▶ slot-commands ──▶ Field Service
//! Field Service ──SlotHeld──────────▶ slot-events   ──▶ Order Service
//! Order Service ──PaymentRequested──▶ payment-requests ─▶ Payment Service
//! Payment Service ─PaymentSucceeded─▶ payment-outcomes ─▶ Order Service
//! ```
//!
//! # Delivery contract
//!
//! - **At-least-once**: an envelope may be delivered more than once
//! - **Ordered per key**: envelopes with the same `key` arrive in publish order
//! - **No cross-key ordering**: consumers must not rely on it
//!
//! Consumers make re-delivery harmless by remembering the last processed
//! `event_id` per key (see [`crate::inbox`]).
//!
//! # Implementations
//!
//! - `InMemoryEventBus` in `fieldbook-testing`, for tests and the standalone binary
//! - `RedpandaEventBus` in `fieldbook-redpanda`, for production (Kafka-compatible)

use crate::event::EventEnvelope;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// A message on the bus was not a valid envelope
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Topic not found or invalid
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl EventBusError {
    /// Whether retrying the same operation later can succeed.
    ///
    /// Malformed messages and unknown topics never heal by themselves.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::DeserializationFailed(_) | Self::InvalidTopic(_)
        )
    }
}

/// Acknowledgement handle for one delivered envelope.
///
/// Transports that track consumer progress (Kafka offsets) only advance past
/// an envelope once it is acknowledged. Dropping an `Ack` without calling
/// [`Ack::ack`] leaves the envelope eligible for re-delivery.
pub struct Ack(Option<Box<dyn FnOnce() + Send>>);

impl Ack {
    /// An acknowledgement that does nothing, for transports without progress tracking.
    #[must_use]
    pub const fn noop() -> Self {
        Self(None)
    }

    /// An acknowledgement that runs `on_ack` when acknowledged.
    #[must_use]
    pub fn new(on_ack: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(on_ack)))
    }

    /// Mark the envelope as fully processed.
    pub fn ack(mut self) {
        if let Some(on_ack) = self.0.take() {
            on_ack();
        }
    }
}

impl std::fmt::Debug for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Ack").field(&self.0.is_some()).finish()
    }
}

/// One envelope handed to a subscriber, with its acknowledgement.
#[derive(Debug)]
pub struct Delivery {
    /// The delivered envelope.
    pub envelope: EventEnvelope,
    /// Acknowledge once processing is complete.
    pub ack: Ack,
}

impl Delivery {
    /// A delivery whose acknowledgement is a no-op.
    #[must_use]
    pub const fn unacked(envelope: EventEnvelope) -> Self {
        Self {
            envelope,
            ack: Ack::noop(),
        }
    }
}

/// Stream of deliveries from a subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventBusError>> + Send>>;

/// Publish/subscribe transport between services.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the
/// bus can be shared as `Arc<dyn EventBus>` between publishers and consumers.
pub trait EventBus: Send + Sync {
    /// Publish an envelope to a topic, partitioned by `envelope.key`.
    ///
    /// Returning `Ok` means the bus has durably accepted the envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish operation fails.
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more topics.
    ///
    /// Each consumer group receives its own copy of every envelope; group
    /// membership is an implementation concern.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn ack_runs_callback_once() {
        let acked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&acked);
        let ack = Ack::new(move || flag.store(true, Ordering::SeqCst));

        assert!(!acked.load(Ordering::SeqCst));
        ack.ack();
        assert!(acked.load(Ordering::SeqCst));
    }

    #[test]
    fn dropped_ack_does_not_acknowledge() {
        let acked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&acked);
        drop(Ack::new(move || flag.store(true, Ordering::SeqCst)));

        assert!(!acked.load(Ordering::SeqCst));
    }

    #[test]
    fn malformed_messages_are_not_transient() {
        assert!(!EventBusError::DeserializationFailed("x".into()).is_transient());
        assert!(!EventBusError::InvalidTopic("x".into()).is_transient());
        assert!(EventBusError::TransportError("x".into()).is_transient());
        assert!(
            EventBusError::PublishFailed {
                topic: "t".into(),
                reason: "timeout".into()
            }
            .is_transient()
        );
    }
}
