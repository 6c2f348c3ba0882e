//! In-memory event bus for tests and single-process runs.
//!
//! Publishing appends to a per-topic log and fans the envelope out to every
//! live subscription of that topic. The log lock is held while fanning out,
//! so every subscriber sees one topic in exactly the publish order, which is
//! stricter than the per-key guarantee production transports give.
//!
//! Tests can also:
//! - read the publish log ([`InMemoryEventBus::published`])
//! - re-deliver an envelope to simulate at-least-once duplicates
//!   ([`InMemoryEventBus::redeliver`])
//! - make the next publishes fail to simulate an unavailable broker
//!   ([`InMemoryEventBus::fail_next_publishes`])

use fieldbook_core::event::{EventEnvelope, EventId};
use fieldbook_core::event_bus::{Delivery, EventBus, EventBusError, EventStream};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

type Subscriber = (Vec<String>, mpsc::UnboundedSender<EventEnvelope>);

#[derive(Default)]
struct Inner {
    log: HashMap<String, Vec<EventEnvelope>>,
    subscribers: Vec<Subscriber>,
    failures_pending: usize,
}

impl Inner {
    fn fan_out(&mut self, topic: &str, envelope: &EventEnvelope) {
        // Closed subscriptions are pruned as they are discovered.
        self.subscribers.retain(|(topics, sender)| {
            if topics.iter().any(|t| t == topic) {
                sender.send(envelope.clone()).is_ok()
            } else {
                !sender.is_closed()
            }
        });
    }
}

/// Event bus held entirely in memory. Clones share the same bus.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every envelope published to `topic`, in publish order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<EventEnvelope> {
        self.lock().log.get(topic).cloned().unwrap_or_default()
    }

    /// Event types published to `topic`, in publish order.
    #[must_use]
    pub fn published_types(&self, topic: &str) -> Vec<String> {
        self.published(topic)
            .into_iter()
            .map(|envelope| envelope.event_type)
            .collect()
    }

    /// Total number of envelopes published across all topics.
    #[must_use]
    pub fn published_count(&self) -> usize {
        self.lock().log.values().map(Vec::len).sum()
    }

    /// Deliver an already published envelope again to current subscribers.
    ///
    /// Returns `false` if no envelope with `event_id` was published to `topic`.
    pub fn redeliver(&self, topic: &str, event_id: EventId) -> bool {
        let mut inner = self.lock();
        let Some(envelope) = inner
            .log
            .get(topic)
            .and_then(|log| log.iter().find(|e| e.event_id == event_id))
            .cloned()
        else {
            return false;
        };
        inner.fan_out(topic, &envelope);
        true
    }

    /// Make the next `count` publishes fail with a transport error.
    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().failures_pending = count;
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|(_, sender)| !sender.is_closed())
            .count()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let envelope = envelope.clone();
        Box::pin(async move {
            let mut inner = self.lock();
            if inner.failures_pending > 0 {
                inner.failures_pending -= 1;
                return Err(EventBusError::PublishFailed {
                    topic,
                    reason: "injected failure".to_string(),
                });
            }
            inner.fan_out(&topic, &envelope);
            inner.log.entry(topic).or_default().push(envelope);
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();
        Box::pin(async move {
            if topics.is_empty() {
                return Err(EventBusError::SubscriptionFailed {
                    topics,
                    reason: "no topics given".to_string(),
                });
            }
            let (sender, mut receiver) = mpsc::unbounded_channel();
            self.lock().subscribers.push((topics, sender));

            let stream: EventStream = Box::pin(async_stream::stream! {
                while let Some(envelope) = receiver.recv().await {
                    yield Ok(Delivery::unacked(envelope));
                }
            });
            Ok(stream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;

    fn envelope(key: &str, n: u8) -> EventEnvelope {
        EventEnvelope {
            event_id: EventId::new(),
            event_type: format!("Test{n}.v1"),
            key: key.to_string(),
            payload: vec![n],
            occurred_at: Utc::now(),
            causation_id: None,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_in_publish_order() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe(&["a"]).await.unwrap();

        for n in 0..5 {
            bus.publish("a", &envelope("k", n)).await.unwrap();
        }

        for n in 0..5 {
            let delivery = stream.next().await.unwrap().unwrap();
            assert_eq!(delivery.envelope.payload, vec![n]);
        }
    }

    #[tokio::test]
    async fn only_matching_topics_are_delivered() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe(&["b"]).await.unwrap();

        bus.publish("a", &envelope("k", 1)).await.unwrap();
        bus.publish("b", &envelope("k", 2)).await.unwrap();

        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.envelope.payload, vec![2]);
        assert_eq!(bus.published_types("a"), vec!["Test1.v1"]);
    }

    #[tokio::test]
    async fn redeliver_sends_duplicate() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe(&["a"]).await.unwrap();
        let original = envelope("k", 9);
        bus.publish("a", &original).await.unwrap();

        assert!(bus.redeliver("a", original.event_id));
        assert!(!bus.redeliver("a", EventId::new()));

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.envelope, second.envelope);
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_not_logged() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_publishes(1);

        let err = bus.publish("a", &envelope("k", 1)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(bus.published("a").is_empty());

        bus.publish("a", &envelope("k", 1)).await.unwrap();
        assert_eq!(bus.published("a").len(), 1);
    }

    #[tokio::test]
    async fn dropped_streams_are_pruned() {
        let bus = InMemoryEventBus::new();
        let stream = bus.subscribe(&["a"]).await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);

        drop(stream);
        bus.publish("a", &envelope("k", 1)).await.unwrap();
        assert_eq!(bus.subscriber_count(), 0);
    }
}
