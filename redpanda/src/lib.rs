//! Redpanda event bus for the Fieldbook services.
//!
//! Implements [`EventBus`] on top of rdkafka, so any Kafka-compatible broker
//! works (Redpanda, Apache Kafka, MSK).
//!
//! # Wire format
//!
//! Every record carries one bincode-encoded [`EventEnvelope`] as its value and
//! the envelope's `key` as its record key. Kafka partitions by record key, so
//! envelopes for one slot (or one reservation) stay in one partition and keep
//! their publish order.
//!
//! # Delivery semantics
//!
//! **At-least-once**, driven by acknowledgements:
//!
//! - each record is handed to the subscriber as a [`Delivery`] whose [`Ack`]
//!   reports back to the consumer task
//! - offsets are *stored* only up to the lowest unacknowledged offset of each
//!   partition, and librdkafka auto-commits stored offsets
//! - a crash or rebalance re-delivers everything past the committed position
//!
//! A delivery that is never acknowledged (its consumer could neither handle
//! nor dead-letter it) pins its partition's committed position until the
//! process restarts.
//!
//! # Example
//!
//! ```no_run
//! use fieldbook_core::event_bus::EventBus;
//! use fieldbook_redpanda::RedpandaEventBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("field-service")
//!     .build()?;
//!
//! let mut stream = bus.subscribe(&["fieldbook.slot-commands"]).await?;
//! while let Some(delivery) = stream.next().await {
//!     let delivery = delivery?;
//!     println!("received {}", delivery.envelope.event_type);
//!     delivery.ack.ack();
//! }
//! # Ok(())
//! # }
//! ```

mod offsets;

use fieldbook_core::event::EventEnvelope;
use fieldbook_core::event_bus::{Ack, Delivery, EventBus, EventBusError, EventStream};
use offsets::OffsetTracker;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

/// Position acknowledged by a subscriber: `(topic, partition, offset)`.
type AckedOffset = (String, i32, i64);

/// Kafka-compatible [`EventBus`].
///
/// One producer is shared by all publishes. Every [`EventBus::subscribe`]
/// call creates its own consumer in the configured consumer group, owned by
/// a background task that forwards records into a bounded channel.
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: Option<String>,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Create a bus with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Start configuring a bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// The bootstrap servers this bus connects to.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    fn group_id(&self, topics: &[String]) -> String {
        self.consumer_group.clone().unwrap_or_else(|| {
            let mut sorted = topics.to_vec();
            sorted.sort();
            format!("fieldbook-{}", sorted.join("-"))
        })
    }
}

/// Builder for [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Comma-separated bootstrap servers, e.g. `"localhost:9092"`.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgement mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`, so a successful publish survives a broker loss.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"` or `"zstd"`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout. Default: 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Consumer group for subscriptions.
    ///
    /// Instances of one service share a group and split the partitions
    /// between them. Without it, the group is derived from the topic names.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Records buffered between the Kafka consumer and the subscriber.
    ///
    /// Default: 1000. Zero is treated as one.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Where a new consumer group starts: `"earliest"` or `"latest"`.
    ///
    /// Default: `"earliest"`, so commands published before the first
    /// subscriber joined are not skipped.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the bus.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are missing or
    /// the producer configuration is rejected.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        let compression = self.compression.unwrap_or_else(|| "none".to_string());
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", &acks)
            .set("compression.type", &compression)
            .create()
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let buffer_size = self.buffer_size.unwrap_or(1000);
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks = %acks,
            compression = %compression,
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaEventBus created"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout,
            consumer_group: self.consumer_group,
            buffer_size,
            auto_offset_reset,
        })
    }
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let envelope = envelope.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let payload = envelope.to_bytes().map_err(|e| EventBusError::PublishFailed {
                topic: topic.clone(),
                reason: e.to_string(),
            })?;

            let record = FutureRecord::to(&topic)
                .payload(&payload)
                .key(envelope.key.as_bytes());

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        event_type = %envelope.event_type,
                        event_id = %envelope.event_id,
                        "Envelope published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::warn!(topic = %topic, error = %kafka_error, "Failed to publish envelope");
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                }
            }
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
            let group_id = self.group_id(&topics);

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "true")
                .set("enable.auto.offset.store", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %group_id,
                buffer_size = self.buffer_size,
                "Subscribed to topics"
            );

            let (tx, mut rx) = mpsc::channel(self.buffer_size);
            tokio::spawn(forward(consumer, tx));

            let stream = async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            Ok(Box::pin(stream) as EventStream)
        })
    }
}

/// Owns the consumer: forwards records to the subscriber and stores offsets
/// as acknowledgements come back.
async fn forward(consumer: StreamConsumer, tx: mpsc::Sender<Result<Delivery, EventBusError>>) {
    use futures::StreamExt;

    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<AckedOffset>();
    let mut tracker = OffsetTracker::default();
    let mut records = consumer.stream();

    loop {
        tokio::select! {
            Some((topic, partition, offset)) = ack_rx.recv() => {
                if let Some(position) = tracker.acked(&topic, partition, offset) {
                    store_position(&consumer, &topic, partition, position);
                }
            }
            record = records.next() => {
                let Some(record) = record else { break };
                let item = match record {
                    Ok(message) => {
                        let item = decode(&message, &ack_tx);
                        tracker.delivered(message.topic(), message.partition(), message.offset());
                        if item.is_err() {
                            // Malformed records are reported once and then
                            // treated as handled.
                            if let Some(position) =
                                tracker.acked(message.topic(), message.partition(), message.offset())
                            {
                                store_position(&consumer, message.topic(), message.partition(), position);
                            }
                        }
                        item
                    }
                    Err(e) => Err(EventBusError::TransportError(format!("Failed to receive record: {e}"))),
                };
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!(in_flight = tracker.in_flight(), "Consumer task exiting");
}

fn decode(
    message: &BorrowedMessage<'_>,
    ack_tx: &mpsc::UnboundedSender<AckedOffset>,
) -> Result<Delivery, EventBusError> {
    let payload = message
        .payload()
        .ok_or_else(|| EventBusError::DeserializationFailed("record has no payload".to_string()))?;
    let envelope = EventEnvelope::from_bytes(payload)
        .map_err(|e| EventBusError::DeserializationFailed(e.to_string()))?;

    tracing::trace!(
        topic = message.topic(),
        partition = message.partition(),
        offset = message.offset(),
        event_type = %envelope.event_type,
        "Received envelope"
    );

    let position: AckedOffset = (message.topic().to_string(), message.partition(), message.offset());
    let ack_tx = ack_tx.clone();
    Ok(Delivery {
        envelope,
        ack: Ack::new(move || {
            // The consumer task may already be gone; the record is then
            // re-delivered to whoever owns the partition next.
            let _ = ack_tx.send(position);
        }),
    })
}

fn store_position(consumer: &StreamConsumer, topic: &str, partition: i32, position: i64) {
    let mut list = TopicPartitionList::new();
    let stored = list
        .add_partition_offset(topic, partition, Offset::Offset(position))
        .and_then(|()| consumer.store_offsets(&list));
    if let Err(e) = stored {
        // Typically the partition was revoked in a rebalance.
        tracing::debug!(topic, partition, position, error = %e, "Could not store offset");
    }
}
