//! Per-consumer record of processed events.
//!
//! The bus delivers at least once. A consumer remembers, for every partition
//! key it has seen, the id of the last envelope it fully processed. Because
//! envelopes of one key arrive in order, a re-delivery after a crash or a
//! rebalance is the envelope recorded last, and the consumer skips it.
//!
//! Handlers that persist their own `last_event_id` next to the aggregate (so
//! state change and dedup marker commit together) treat the inbox as a fast
//! path only.

use crate::event::EventId;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from inbox storage.
#[derive(Error, Debug, Clone)]
pub enum InboxError {
    /// The backing store could not be reached or rejected the query.
    #[error("inbox storage error: {0}")]
    Storage(String),
}

/// Storage for "last processed event id per (consumer, key)".
pub trait Inbox: Send + Sync {
    /// The last envelope recorded for `key` by `consumer`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`InboxError::Storage`] when the store is unavailable.
    fn last_processed<'a>(
        &'a self,
        consumer: &'a str,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EventId>, InboxError>> + Send + 'a>>;

    /// Record `event_id` as the last envelope processed for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`InboxError::Storage`] when the store is unavailable.
    fn record<'a>(
        &'a self,
        consumer: &'a str,
        key: &'a str,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<(), InboxError>> + Send + 'a>>;
}
