//! Dead letter handling for envelopes that cannot be processed.
//!
//! An envelope lands here when its handler reports it as invalid or fatal, or
//! when transient failures outlast the retry policy. Isolating it lets the
//! rest of the key's stream move on instead of blocking behind one bad message.
//!
//! [`DeadLetterSink`] is the storage seam: [`InMemoryDeadLetterQueue`] for
//! tests and the standalone binary, a Postgres table in production.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldbook_core::error::HandlerError;
use fieldbook_core::event::{EventEnvelope, EventId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// A message that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// Consumer that gave up on the message.
    pub consumer: String,
    /// Id of the envelope, `None` if the message was not a decodable envelope.
    pub event_id: Option<EventId>,
    /// Event type, empty when unknown.
    pub event_type: String,
    /// Partition key, empty when unknown.
    pub key: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Failure classification (`transient`, `invalid`, `fatal`, `malformed`).
    pub error_kind: String,
    /// The last error message.
    pub error_message: String,
    /// Attempts made before giving up.
    pub attempts: usize,
    /// When the consumer gave up.
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Dead letter for an envelope whose handler failed.
    #[must_use]
    pub fn from_envelope(
        consumer: &str,
        envelope: &EventEnvelope,
        error: &HandlerError,
        attempts: usize,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            consumer: consumer.to_string(),
            event_id: Some(envelope.event_id),
            event_type: envelope.event_type.clone(),
            key: envelope.key.clone(),
            payload: envelope.payload.clone(),
            error_kind: error.kind().to_string(),
            error_message: error.to_string(),
            attempts,
            failed_at,
        }
    }

    /// Dead letter for a bus message that was not a valid envelope.
    #[must_use]
    pub fn malformed(consumer: &str, reason: impl Into<String>, failed_at: DateTime<Utc>) -> Self {
        Self {
            consumer: consumer.to_string(),
            event_id: None,
            event_type: String::new(),
            key: String::new(),
            payload: Vec::new(),
            error_kind: "malformed".to_string(),
            error_message: reason.into(),
            attempts: 1,
            failed_at,
        }
    }
}

/// Errors from dead letter storage.
#[derive(Error, Debug, Clone)]
pub enum DeadLetterError {
    /// The backing store rejected the write.
    #[error("dead letter storage error: {0}")]
    Storage(String),
}

/// Where dead letters are kept.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Store a dead letter.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] when the entry could not be stored.
    async fn push(&self, letter: DeadLetter) -> Result<(), DeadLetterError>;
}

/// Bounded in-memory dead letter queue.
///
/// Oldest entries are dropped once `max_size` is reached. Clones share storage.
#[derive(Debug, Clone)]
pub struct InMemoryDeadLetterQueue {
    queue: Arc<Mutex<VecDeque<DeadLetter>>>,
    max_size: usize,
}

impl InMemoryDeadLetterQueue {
    /// Create a queue holding at most `max_size` entries.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size,
        }
    }

    /// Current number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<DeadLetter> {
        let entries: Vec<_> = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        metrics::gauge!("dead_letters_pending").set(0.0);
        entries
    }
}

impl Default for InMemoryDeadLetterQueue {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterQueue {
    async fn push(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        if queue.len() >= self.max_size {
            queue.pop_front();
            metrics::counter!("dead_letters_dropped_total").increment(1);
            tracing::warn!(max_size = self.max_size, "Dead letter queue at capacity, dropping oldest entry");
        }

        tracing::error!(
            consumer = %letter.consumer,
            event_type = %letter.event_type,
            key = %letter.key,
            error_kind = %letter.error_kind,
            error = %letter.error_message,
            "Message dead-lettered"
        );
        queue.push_back(letter);

        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("dead_letters_pending").set(queue.len() as f64);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn letter(reason: &str) -> DeadLetter {
        DeadLetter::malformed("test-consumer", reason, Utc::now())
    }

    #[tokio::test]
    async fn drops_oldest_when_full() {
        let dlq = InMemoryDeadLetterQueue::new(2);
        dlq.push(letter("first")).await.unwrap();
        dlq.push(letter("second")).await.unwrap();
        dlq.push(letter("third")).await.unwrap();

        let reasons: Vec<_> = dlq.entries().into_iter().map(|l| l.error_message).collect();
        assert_eq!(reasons, vec!["second", "third"]);
    }

    #[tokio::test]
    async fn drain_empties_the_queue() {
        let dlq = InMemoryDeadLetterQueue::default();
        dlq.push(letter("bad bytes")).await.unwrap();

        assert_eq!(dlq.drain().len(), 1);
        assert!(dlq.is_empty());
    }

    #[test]
    fn envelope_letter_keeps_identity() {
        let envelope = EventEnvelope {
            event_id: EventId::new(),
            event_type: "SlotHeld.v1".into(),
            key: "r-1".into(),
            payload: vec![1, 2, 3],
            occurred_at: Utc::now(),
            causation_id: None,
        };
        let letter = DeadLetter::from_envelope(
            "order-service",
            &envelope,
            &HandlerError::invalid("no such reservation"),
            1,
            Utc::now(),
        );

        assert_eq!(letter.event_id, Some(envelope.event_id));
        assert_eq!(letter.error_kind, "invalid");
        assert_eq!(letter.payload, vec![1, 2, 3]);
    }
}
