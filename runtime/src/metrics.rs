//! Prometheus metrics export.
//!
//! Components record through the `metrics` facade (`counter!`, `gauge!`,
//! `histogram!`). Nothing is exported until a [`MetricsServer`] installs the
//! Prometheus recorder; before that, recording is a no-op, which keeps tests
//! free of global state.
//!
//! # Example
//!
//! ```rust,no_run
//! use fieldbook_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Scrape http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

// Re-export metrics macros for use in other crates
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Serves `/metrics` on `addr` from a background task owned by the exporter.
/// Must be started inside a tokio runtime.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new, not yet started, metrics server.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and start serving.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if the listener cannot be bound or a
    /// different recorder is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics listener stopped");
            }
        });
        self.handle = Some(handle);

        tracing::info!(addr = %self.addr, "Metrics server started - available at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register descriptions for the runtime's own metrics.
fn register_metrics() {
    describe_counter!(
        "consumer_events_processed_total",
        "Envelopes fully processed by a consumer"
    );
    describe_counter!(
        "consumer_events_duplicate_total",
        "Envelopes skipped because the inbox had already recorded them"
    );
    describe_counter!(
        "consumer_events_retried_total",
        "Handler attempts that failed transiently and were retried"
    );
    describe_histogram!(
        "consumer_handle_duration_seconds",
        "Time spent handling one envelope, retries included"
    );
    describe_counter!(
        "dead_letters_dropped_total",
        "Dead letters evicted from a full in-memory queue"
    );
    describe_counter!(
        "dead_letters_total",
        "Envelopes dead-lettered by consumers"
    );
    describe_gauge!(
        "dead_letters_pending",
        "Dead letters currently held in memory"
    );
    describe_counter!("sweep_resolved_total", "Records resolved by deadline sweeps");
    describe_counter!("sweep_failures_total", "Sweep passes that failed");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn unstarted_server_renders_nothing() {
        let server = MetricsServer::new(SocketAddr::from(([127, 0, 0, 1], 0)));
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn started_server_renders_described_metrics() {
        let mut server = MetricsServer::new(SocketAddr::from(([127, 0, 0, 1], 0)));
        server.start().unwrap();

        metrics::counter!("consumer_events_processed_total", "consumer" => "test").increment(1);
        let rendered = server.render().unwrap();
        assert!(rendered.contains("consumer_events_processed_total"));
    }
}
