//! Partitioned event bus consumer with dedup, retries and dead-lettering.
//!
//! `EventConsumer` owns the subscribe-process-reconnect loop for one consumer
//! group member. Deliveries are fanned out to a fixed pool of workers by a
//! stable hash of the envelope key:
//!
//! ```text
//!                        ┌─▶ worker 0 ─ keys hashing to 0, in order
//! bus ─▶ EventConsumer ──┼─▶ worker 1 ─ keys hashing to 1, in order
//!                        └─▶ worker N ─ ...
//! ```
//!
//! Envelopes with the same key always reach the same worker and are handled
//! one after another, so per-key order survives. Unrelated keys proceed in
//! parallel.
//!
//! For every envelope a worker:
//!
//! 1. skips it if the inbox says it is the last one processed for its key
//! 2. calls the [`EventHandler`], retrying transient failures with backoff
//! 3. dead-letters invalid or fatal failures and exhausted retries
//! 4. records the envelope in the inbox and acknowledges the delivery
//!
//! A delivery is acknowledged only after step 4, so a crash anywhere earlier
//! leads to re-delivery rather than loss.
//!
//! # Example
//!
//! ```rust,ignore
//! let consumer = EventConsumer::builder()
//!     .name("order-service")
//!     .topics(vec![topics::SLOT_EVENTS.to_string()])
//!     .event_bus(event_bus)
//!     .handler(handler)
//!     .inbox(inbox)
//!     .dead_letters(dlq)
//!     .workers(8)
//!     .shutdown(shutdown_rx)
//!     .build()?;
//!
//! let handle = consumer.spawn();
//! ```

use crate::dead_letter::{DeadLetter, DeadLetterSink, InMemoryDeadLetterQueue};
use crate::handler::EventHandler;
use crate::inbox::InMemoryInbox;
use crate::retry::{RetryPolicy, retry_counted};
use fieldbook_core::environment::{Clock, SystemClock};
use fieldbook_core::error::HandlerError;
use fieldbook_core::event_bus::{Delivery, EventBus, EventStream};
use fieldbook_core::inbox::Inbox;
use futures::StreamExt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The handler succeeded.
    Processed,
    /// The inbox had already recorded this envelope; the handler was not called.
    Duplicate,
    /// The handler failed permanently; the envelope went to the dead letter sink.
    DeadLettered,
    /// Neither handled nor dead-lettered; the delivery was left unacknowledged.
    Unacknowledged,
}

/// Errors building a consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// A required builder field was not set.
    #[error("consumer builder is missing `{0}`")]
    Missing(&'static str),
    /// The worker count must be positive.
    #[error("consumer needs at least one worker")]
    NoWorkers,
}

/// Everything a worker needs to process a delivery.
struct Pipeline {
    name: String,
    handler: Arc<dyn EventHandler>,
    inbox: Arc<dyn Inbox>,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    async fn process(&self, delivery: Delivery) -> Outcome {
        let Delivery { envelope, ack } = delivery;

        match self.inbox.last_processed(&self.name, &envelope.key).await {
            Ok(Some(last)) if last == envelope.event_id => {
                debug!(
                    consumer = %self.name,
                    event_id = %envelope.event_id,
                    key = %envelope.key,
                    "Skipping already processed envelope"
                );
                metrics::counter!("consumer_events_duplicate_total", "consumer" => self.name.clone())
                    .increment(1);
                ack.ack();
                return Outcome::Duplicate;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(consumer = %self.name, error = %e, "Inbox unavailable, relying on handler idempotency");
            }
        }

        let started = Instant::now();
        let attempted = retry_counted(
            &self.retry,
            || self.handler.handle(&envelope),
            |e: &HandlerError| e.is_retryable(),
        )
        .await;
        metrics::histogram!("consumer_handle_duration_seconds", "consumer" => self.name.clone())
            .record(started.elapsed().as_secs_f64());
        if attempted.attempts > 1 {
            metrics::counter!("consumer_events_retried_total", "consumer" => self.name.clone())
                .increment((attempted.attempts - 1) as u64);
        }

        let outcome = match attempted.result {
            Ok(()) => {
                debug!(
                    consumer = %self.name,
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    "Envelope processed"
                );
                metrics::counter!("consumer_events_processed_total", "consumer" => self.name.clone())
                    .increment(1);
                Outcome::Processed
            }
            Err(failure) => {
                let letter = DeadLetter::from_envelope(
                    &self.name,
                    &envelope,
                    &failure,
                    attempted.attempts,
                    self.clock.now(),
                );
                if let Err(e) = self.dead_letters.push(letter).await {
                    error!(
                        consumer = %self.name,
                        event_id = %envelope.event_id,
                        error = %e,
                        "Failed to dead-letter envelope, leaving it for re-delivery"
                    );
                    return Outcome::Unacknowledged;
                }
                metrics::counter!(
                    "dead_letters_total",
                    "consumer" => self.name.clone(),
                    "kind" => failure.kind()
                )
                .increment(1);
                Outcome::DeadLettered
            }
        };

        if let Err(e) = self.inbox.record(&self.name, &envelope.key, envelope.event_id).await {
            warn!(consumer = %self.name, error = %e, "Failed to record envelope in inbox");
        }
        ack.ack();
        outcome
    }

    async fn dead_letter_malformed(&self, reason: String) {
        let letter = DeadLetter::malformed(&self.name, reason, self.clock.now());
        if let Err(e) = self.dead_letters.push(letter).await {
            error!(consumer = %self.name, error = %e, "Failed to dead-letter malformed message");
        }
    }
}

/// Worker index for `key` among `workers` workers.
fn worker_for(key: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    #[allow(clippy::cast_possible_truncation)]
    {
        (hasher.finish() % workers as u64) as usize
    }
}

/// Event bus consumer for one consumer group member.
pub struct EventConsumer {
    topics: Vec<String>,
    event_bus: Arc<dyn EventBus>,
    pipeline: Arc<Pipeline>,
    workers: usize,
    queue_depth: usize,
    shutdown: broadcast::Receiver<()>,
    reconnect_delay: Duration,
}

impl EventConsumer {
    /// Create a builder for configuring a consumer.
    #[must_use]
    pub fn builder() -> EventConsumerBuilder {
        EventConsumerBuilder::default()
    }

    /// Consumer name, also the inbox namespace.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.pipeline.name
    }

    /// Process a single delivery inline, bypassing the worker pool.
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        self.pipeline.process(delivery).await
    }

    /// Spawn the consumer as a background task.
    ///
    /// The task runs until a shutdown signal is received; in-flight envelopes
    /// are drained before it exits.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(consumer = %self.pipeline.name, workers = self.workers, "Event consumer started");

        loop {
            let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();

            let stream = tokio::select! {
                _ = self.shutdown.recv() => break,
                subscribed = self.event_bus.subscribe(&topics) => subscribed,
            };

            match stream {
                Ok(stream) => {
                    info!(consumer = %self.pipeline.name, topics = ?self.topics, "Subscribed to event bus");
                    if self.consume(stream).await {
                        break;
                    }
                    warn!(
                        consumer = %self.pipeline.name,
                        "Event stream ended, reconnecting in {:?}",
                        self.reconnect_delay
                    );
                }
                Err(e) => {
                    error!(
                        consumer = %self.pipeline.name,
                        error = %e,
                        "Failed to subscribe to event bus, retrying in {:?}",
                        self.reconnect_delay
                    );
                }
            }

            tokio::select! {
                _ = self.shutdown.recv() => break,
                () = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        info!(consumer = %self.pipeline.name, "Event consumer stopped");
    }

    /// Fan one subscription out to the workers until it ends.
    ///
    /// Returns `true` if consumption stopped because of a shutdown signal.
    async fn consume(&mut self, mut stream: EventStream) -> bool {
        let mut senders = Vec::with_capacity(self.workers);
        let mut workers = Vec::with_capacity(self.workers);

        for _ in 0..self.workers {
            let (tx, mut rx) = mpsc::channel::<Delivery>(self.queue_depth);
            let pipeline = Arc::clone(&self.pipeline);
            workers.push(tokio::spawn(async move {
                while let Some(delivery) = rx.recv().await {
                    pipeline.process(delivery).await;
                }
            }));
            senders.push(tx);
        }

        let shutdown = loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.pipeline.name, "Event consumer received shutdown signal");
                    break true;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(delivery)) => {
                            let index = worker_for(&delivery.envelope.key, senders.len());
                            let Some(worker) = senders.get(index) else {
                                break false;
                            };
                            if worker.send(delivery).await.is_err() {
                                error!(consumer = %self.pipeline.name, worker = index, "Worker stopped unexpectedly");
                                break false;
                            }
                        }
                        Some(Err(e)) if !e.is_transient() => {
                            self.pipeline.dead_letter_malformed(e.to_string()).await;
                        }
                        Some(Err(e)) => {
                            warn!(consumer = %self.pipeline.name, error = %e, "Error receiving from event stream");
                        }
                        None => break false,
                    }
                }
            }
        };

        drop(senders);
        for worker in workers {
            if let Err(e) = worker.await {
                error!(consumer = %self.pipeline.name, error = %e, "Worker task panicked");
            }
        }
        shutdown
    }
}

/// Builder for configuring an [`EventConsumer`].
#[derive(Default)]
pub struct EventConsumerBuilder {
    name: Option<String>,
    topics: Option<Vec<String>>,
    event_bus: Option<Arc<dyn EventBus>>,
    handler: Option<Arc<dyn EventHandler>>,
    inbox: Option<Arc<dyn Inbox>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    retry: Option<RetryPolicy>,
    clock: Option<Arc<dyn Clock>>,
    workers: Option<usize>,
    queue_depth: Option<usize>,
    shutdown: Option<broadcast::Receiver<()>>,
    reconnect_delay: Option<Duration>,
}

impl EventConsumerBuilder {
    /// Set consumer name (required). Also namespaces inbox markers.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set topics to subscribe to (required).
    #[must_use]
    pub fn topics(mut self, topics: Vec<String>) -> Self {
        self.topics = Some(topics);
        self
    }

    /// Set event bus instance (required).
    #[must_use]
    pub fn event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Set event handler (required).
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set shutdown signal receiver (required).
    #[must_use]
    pub fn shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Set the inbox (default: in-memory).
    #[must_use]
    pub fn inbox(mut self, inbox: Arc<dyn Inbox>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    /// Set the dead letter sink (default: in-memory, 1000 entries).
    #[must_use]
    pub fn dead_letters(mut self, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    /// Set the retry policy for transient handler failures.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the clock used to timestamp dead letters.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set number of workers (default: 4).
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Set per-worker queue depth (default: 64).
    #[must_use]
    pub const fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = Some(depth);
        self
    }

    /// Set delay before resubscribing after a failure (default: 5 seconds).
    #[must_use]
    pub const fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    /// Build the [`EventConsumer`].
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Missing`] if a required field is unset and
    /// [`ConsumerError::NoWorkers`] if the worker count is zero.
    pub fn build(self) -> Result<EventConsumer, ConsumerError> {
        let workers = self.workers.unwrap_or(4);
        if workers == 0 {
            return Err(ConsumerError::NoWorkers);
        }

        let pipeline = Pipeline {
            name: self.name.ok_or(ConsumerError::Missing("name"))?,
            handler: self.handler.ok_or(ConsumerError::Missing("handler"))?,
            inbox: self.inbox.unwrap_or_else(|| Arc::new(InMemoryInbox::new())),
            dead_letters: self
                .dead_letters
                .unwrap_or_else(|| Arc::new(InMemoryDeadLetterQueue::default())),
            retry: self.retry.unwrap_or_default(),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };

        Ok(EventConsumer {
            topics: self.topics.ok_or(ConsumerError::Missing("topics"))?,
            event_bus: self.event_bus.ok_or(ConsumerError::Missing("event_bus"))?,
            pipeline: Arc::new(pipeline),
            workers,
            queue_depth: self.queue_depth.unwrap_or(64).max(1),
            shutdown: self.shutdown.ok_or(ConsumerError::Missing("shutdown"))?,
            reconnect_delay: self.reconnect_delay.unwrap_or(Duration::from_secs(5)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_always_maps_to_same_worker() {
        for workers in 1..16 {
            let first = worker_for("slot-42", workers);
            assert!(first < workers);
            assert_eq!(first, worker_for("slot-42", workers));
        }
    }

    #[test]
    fn keys_spread_across_workers() {
        let used: std::collections::HashSet<_> =
            (0..200).map(|i| worker_for(&format!("key-{i}"), 8)).collect();
        assert!(used.len() > 1);
    }
}
