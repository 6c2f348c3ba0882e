//! Event handler trait consumed by [`EventConsumer`](crate::consumer::EventConsumer).
//!
//! A handler receives one envelope at a time for a given key. It reports
//! failures through [`HandlerError`] and leaves retrying, dead-lettering and
//! dedup bookkeeping to the consumer.

use async_trait::async_trait;
use fieldbook_core::error::HandlerError;
use fieldbook_core::event::EventEnvelope;

/// Processes envelopes delivered by an event consumer.
///
/// Implementations must be idempotent: the same envelope can arrive again
/// after a crash, a rebalance or a publisher retry.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one envelope.
    ///
    /// # Errors
    ///
    /// - [`HandlerError::Transient`]: the consumer retries with backoff
    /// - [`HandlerError::Invalid`] / [`HandlerError::Fatal`]: the envelope is dead-lettered
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}
