//! Event consumer behavior over the in-memory bus: dedup, retries,
//! dead-lettering, per-key order and shutdown.

#![allow(clippy::unwrap_used, clippy::panic)]

use async_trait::async_trait;
use chrono::Utc;
use fieldbook_core::error::HandlerError;
use fieldbook_core::event::{EventEnvelope, EventId};
use fieldbook_core::event_bus::{Delivery, EventBus};
use fieldbook_runtime::{
    ConsumerError, EventConsumer, EventHandler, InMemoryDeadLetterQueue, InMemoryInbox, Outcome, RetryPolicy,
};
use fieldbook_testing::{InMemoryEventBus, eventually};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const TOPIC: &str = "test.events";

/// Records handled envelopes and fails on request.
#[derive(Default)]
struct Recorder {
    handled: Mutex<Vec<EventEnvelope>>,
    transient_failures: Mutex<HashMap<EventId, usize>>,
}

impl Recorder {
    fn fail_transiently(&self, event_id: EventId, times: usize) {
        self.transient_failures.lock().unwrap().insert(event_id, times);
    }

    fn handled(&self) -> Vec<EventEnvelope> {
        self.handled.lock().unwrap().clone()
    }

    fn payloads_for(&self, key: &str) -> Vec<u8> {
        self.handled()
            .into_iter()
            .filter(|e| e.key == key)
            .flat_map(|e| e.payload)
            .collect()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        if envelope.event_type == "Poison.v1" {
            return Err(HandlerError::invalid("cannot decode payload"));
        }
        if let Some(left) = self.transient_failures.lock().unwrap().get_mut(&envelope.event_id) {
            if *left > 0 {
                *left -= 1;
                return Err(HandlerError::transient("database unavailable"));
            }
        }
        self.handled.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

fn envelope(event_type: &str, key: &str, n: u8) -> EventEnvelope {
    EventEnvelope {
        event_id: EventId::new(),
        event_type: event_type.to_string(),
        key: key.to_string(),
        payload: vec![n],
        occurred_at: Utc::now(),
        causation_id: None,
    }
}

fn fast_retry(max_retries: usize) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(max_retries)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .build()
}

struct Fixture {
    bus: InMemoryEventBus,
    recorder: Arc<Recorder>,
    dead_letters: InMemoryDeadLetterQueue,
    shutdown: broadcast::Sender<()>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            bus: InMemoryEventBus::new(),
            recorder: Arc::new(Recorder::default()),
            dead_letters: InMemoryDeadLetterQueue::new(100),
            shutdown: broadcast::channel(1).0,
        }
    }

    fn consumer(&self, retry: RetryPolicy) -> EventConsumer {
        EventConsumer::builder()
            .name("test-consumer")
            .topics(vec![TOPIC.to_string()])
            .event_bus(Arc::new(self.bus.clone()))
            .handler(Arc::clone(&self.recorder) as Arc<dyn EventHandler>)
            .inbox(Arc::new(InMemoryInbox::new()))
            .dead_letters(Arc::new(self.dead_letters.clone()))
            .retry(retry)
            .workers(4)
            .queue_depth(8)
            .shutdown(self.shutdown.subscribe())
            .build()
            .unwrap()
    }

    async fn running(&self, retry: RetryPolicy) -> tokio::task::JoinHandle<()> {
        let handle = self.consumer(retry).spawn();
        assert!(eventually(Duration::from_secs(5), || async { self.bus.subscriber_count() == 1 }).await);
        handle
    }
}

#[tokio::test]
async fn redelivered_envelope_is_handled_once() {
    let f = Fixture::new();
    let consumer = f.consumer(RetryPolicy::none());
    let e = envelope("Thing.v1", "k", 1);

    assert_eq!(consumer.process(Delivery::unacked(e.clone())).await, Outcome::Processed);
    assert_eq!(consumer.process(Delivery::unacked(e.clone())).await, Outcome::Duplicate);
    assert_eq!(f.recorder.handled().len(), 1);
}

#[tokio::test]
async fn a_newer_envelope_for_the_key_is_not_a_duplicate() {
    let f = Fixture::new();
    let consumer = f.consumer(RetryPolicy::none());

    consumer.process(Delivery::unacked(envelope("Thing.v1", "k", 1))).await;
    let outcome = consumer.process(Delivery::unacked(envelope("Thing.v1", "k", 2))).await;
    assert_eq!(outcome, Outcome::Processed);
    assert_eq!(f.recorder.payloads_for("k"), vec![1, 2]);
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let f = Fixture::new();
    let consumer = f.consumer(fast_retry(3));
    let e = envelope("Thing.v1", "k", 1);
    f.recorder.fail_transiently(e.event_id, 2);

    assert_eq!(consumer.process(Delivery::unacked(e)).await, Outcome::Processed);
    assert_eq!(f.recorder.handled().len(), 1);
    assert!(f.dead_letters.is_empty());
}

#[tokio::test]
async fn exhausted_retries_are_dead_lettered() {
    let f = Fixture::new();
    let consumer = f.consumer(fast_retry(2));
    let e = envelope("Thing.v1", "k", 1);
    f.recorder.fail_transiently(e.event_id, 10);

    assert_eq!(consumer.process(Delivery::unacked(e.clone())).await, Outcome::DeadLettered);
    let letters = f.dead_letters.entries();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].event_id, Some(e.event_id));
    assert_eq!(letters[0].error_kind, "transient");
    assert_eq!(letters[0].attempts, 3);
}

#[tokio::test]
async fn invalid_envelope_is_dead_lettered_without_retry() {
    let f = Fixture::new();
    let consumer = f.consumer(fast_retry(5));
    let poison = envelope("Poison.v1", "k", 9);

    assert_eq!(consumer.process(Delivery::unacked(poison.clone())).await, Outcome::DeadLettered);
    let letters = f.dead_letters.entries();
    assert_eq!(letters[0].error_kind, "invalid");
    assert_eq!(letters[0].attempts, 1);
    assert_eq!(letters[0].payload, poison.payload);

    // The next envelope for the key is not blocked by the poison one.
    let outcome = consumer.process(Delivery::unacked(envelope("Thing.v1", "k", 1))).await;
    assert_eq!(outcome, Outcome::Processed);
}

#[tokio::test]
async fn running_consumer_keeps_per_key_order() {
    let f = Fixture::new();
    let handle = f.running(RetryPolicy::none()).await;

    for n in 0..20u8 {
        for key in ["a", "b", "c"] {
            f.bus.publish(TOPIC, &envelope("Thing.v1", key, n)).await.unwrap();
        }
    }
    assert!(eventually(Duration::from_secs(5), || async { f.recorder.handled().len() == 60 }).await);

    let expected: Vec<u8> = (0..20).collect();
    for key in ["a", "b", "c"] {
        assert_eq!(f.recorder.payloads_for(key), expected);
    }

    f.shutdown.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn running_consumer_collapses_bus_redelivery() {
    let f = Fixture::new();
    let handle = f.running(RetryPolicy::none()).await;
    let e = envelope("Thing.v1", "k", 1);

    f.bus.publish(TOPIC, &e).await.unwrap();
    assert!(f.bus.redeliver(TOPIC, e.event_id));
    f.bus.publish(TOPIC, &envelope("Thing.v1", "k", 2)).await.unwrap();

    assert!(eventually(Duration::from_secs(5), || async { f.recorder.handled().len() == 2 }).await);
    assert_eq!(f.recorder.payloads_for("k"), vec![1, 2]);

    f.shutdown.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
}

#[test]
fn builder_reports_missing_parts() {
    let missing = EventConsumer::builder().name("x").build().err();
    assert!(matches!(missing, Some(ConsumerError::Missing(_))));

    let f = Fixture::new();
    let no_workers = EventConsumer::builder()
        .name("x")
        .topics(vec![TOPIC.to_string()])
        .event_bus(Arc::new(f.bus.clone()))
        .handler(Arc::clone(&f.recorder) as Arc<dyn EventHandler>)
        .shutdown(f.shutdown.subscribe())
        .workers(0)
        .build()
        .err();
    assert_eq!(no_workers, Some(ConsumerError::NoWorkers));
}
