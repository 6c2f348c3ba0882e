//! Integration tests for [`RedpandaEventBus`] against a real Kafka broker.
//!
//! Marked `#[ignore]` because they need Docker and take tens of seconds to
//! start the broker:
//!
//! ```bash
//! cargo test -p fieldbook-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used, clippy::panic)]

use chrono::Utc;
use fieldbook_core::event::{EventEnvelope, EventId};
use fieldbook_core::event_bus::{EventBus, EventStream};
use fieldbook_redpanda::RedpandaEventBus;
use futures::StreamExt;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

fn envelope(key: &str, n: u8) -> EventEnvelope {
    EventEnvelope {
        event_id: EventId::new(),
        event_type: "SlotHoldRequested.v1".to_string(),
        key: key.to_string(),
        payload: vec![n],
        occurred_at: Utc::now(),
        causation_id: None,
    }
}

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");
    let host = kafka.get_host().await.expect("host");
    let port = kafka.get_host_port_ipv4(KAFKA_PORT).await.expect("port");
    let brokers = format!("{host}:{port}");

    // Publishing succeeds once the broker is up and the topic auto-created.
    let bus = RedpandaEventBus::new(&brokers).expect("bus");
    for attempt in 1..=60 {
        if bus.publish("warmup", &envelope("warmup", 0)).await.is_ok() {
            break;
        }
        assert!(attempt < 60, "Kafka did not become ready");
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    (kafka, brokers)
}

fn bus(brokers: &str, group: &str) -> RedpandaEventBus {
    RedpandaEventBus::builder()
        .brokers(brokers)
        .consumer_group(group)
        .auto_offset_reset("earliest")
        .build()
        .expect("bus")
}

async fn next_payload(stream: &mut EventStream, ack: bool) -> Vec<u8> {
    let delivery = tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .expect("timed out waiting for a delivery")
        .expect("stream ended")
        .expect("delivery error");
    let payload = delivery.envelope.payload.clone();
    if ack {
        delivery.ack.ack();
    }
    payload
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn envelopes_round_trip_in_key_order() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = bus(&brokers, "round-trip");

    for n in 1..=5 {
        bus.publish("fieldbook.slot-commands", &envelope("slot-1", n))
            .await
            .expect("publish");
    }

    let mut stream = bus
        .subscribe(&["fieldbook.slot-commands"])
        .await
        .expect("subscribe");
    for n in 1..=5 {
        assert_eq!(next_payload(&mut stream, true).await, vec![n]);
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn unacknowledged_envelopes_are_redelivered_to_the_group() {
    let (_kafka, brokers) = start_kafka().await;
    let topic = "fieldbook.slot-events";
    let publisher = bus(&brokers, "publisher");
    publisher.publish(topic, &envelope("res-1", 1)).await.expect("publish");
    publisher.publish(topic, &envelope("res-1", 2)).await.expect("publish");

    {
        let first = bus(&brokers, "redelivery");
        let mut stream = first.subscribe(&[topic]).await.expect("subscribe");
        assert_eq!(next_payload(&mut stream, true).await, vec![1]);
        // The second envelope is received but never acknowledged.
        assert_eq!(next_payload(&mut stream, false).await, vec![2]);
        // Give the auto-commit a chance to persist the stored position.
        tokio::time::sleep(Duration::from_secs(6)).await;
    }

    let second = bus(&brokers, "redelivery");
    let mut stream = second.subscribe(&[topic]).await.expect("subscribe");
    assert_eq!(next_payload(&mut stream, true).await, vec![2]);
}
