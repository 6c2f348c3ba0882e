//! # Fieldbook Runtime
//!
//! The imperative shell around the services' event handlers.
//!
//! ## Core Components
//!
//! - **[`EventConsumer`](consumer::EventConsumer)**: subscribes to the bus and fans
//!   deliveries out to a per-key ordered worker pool, with inbox dedup, retries
//!   and dead-lettering
//! - **[`retry`]**: exponential backoff for transient failures
//! - **[`dead_letter`]**: isolation of envelopes that cannot be processed
//! - **[`sweeper`]**: externally driven scans for elapsed deadlines
//! - **[`metrics`]**: Prometheus exporter
//! - **[`health`]**: health reports for service endpoints
//!
//! ## Example
//!
//! ```ignore
//! let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
//!
//! let consumer = EventConsumer::builder()
//!     .name("field-service")
//!     .topics(vec![topics::SLOT_COMMANDS.to_string()])
//!     .event_bus(bus.clone())
//!     .handler(Arc::new(slot_command_handler))
//!     .shutdown(shutdown_tx.subscribe())
//!     .build()?
//!     .spawn();
//!
//! let sweeper = Sweeper::new(clock, Duration::from_secs(5), shutdown_tx.subscribe())
//!     .with_sweep(Arc::new(hold_expiry_sweep))
//!     .spawn();
//! ```

pub mod consumer;
pub mod dead_letter;
pub mod handler;
pub mod health;
pub mod inbox;
pub mod metrics;
pub mod retry;
pub mod sweeper;

pub use consumer::{ConsumerError, EventConsumer, EventConsumerBuilder, Outcome};
pub use dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink, InMemoryDeadLetterQueue};
pub use handler::EventHandler;
pub use inbox::InMemoryInbox;
pub use retry::RetryPolicy;
pub use sweeper::{Sweep, Sweeper};
