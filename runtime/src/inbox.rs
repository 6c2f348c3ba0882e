//! In-memory [`Inbox`] for tests and single-process deployments.

use fieldbook_core::event::EventId;
use fieldbook_core::inbox::{Inbox, InboxError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

/// Inbox backed by a shared hash map. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInbox {
    markers: Arc<Mutex<HashMap<(String, String), EventId>>>,
}

impl InMemoryInbox {
    /// Create an empty inbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys tracked across all consumers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.markers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inbox for InMemoryInbox {
    fn last_processed<'a>(
        &'a self,
        consumer: &'a str,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EventId>, InboxError>> + Send + 'a>> {
        Box::pin(async move {
            Ok(self
                .markers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&(consumer.to_string(), key.to_string()))
                .copied())
        })
    }

    fn record<'a>(
        &'a self,
        consumer: &'a str,
        key: &'a str,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<(), InboxError>> + Send + 'a>> {
        Box::pin(async move {
            self.markers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((consumer.to_string(), key.to_string()), event_id);
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn markers_are_scoped_by_consumer_and_key() {
        let inbox = InMemoryInbox::new();
        let id = EventId::new();

        inbox.record("field-service", "slot-1", id).await.unwrap();

        assert_eq!(inbox.last_processed("field-service", "slot-1").await.unwrap(), Some(id));
        assert_eq!(inbox.last_processed("order-service", "slot-1").await.unwrap(), None);
        assert_eq!(inbox.last_processed("field-service", "slot-2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn record_overwrites_previous_marker() {
        let inbox = InMemoryInbox::new();
        let (first, second) = (EventId::new(), EventId::new());

        inbox.record("c", "k", first).await.unwrap();
        inbox.record("c", "k", second).await.unwrap();

        assert_eq!(inbox.last_processed("c", "k").await.unwrap(), Some(second));
        assert_eq!(inbox.len(), 1);
    }
}
