//! Periodic sweeps over persisted deadlines.
//!
//! Hold TTLs and payment timeouts are not in-process timers. Deadlines live
//! in storage next to the records they guard, and a [`Sweeper`] scans for the
//! ones that have passed. A restart loses nothing: the next sweep finds every
//! deadline that elapsed while the process was down.
//!
//! A [`Sweep`] does one pass for a given `now` and reports how many records it
//! resolved, so tests drive it directly with a manual clock instead of
//! waiting on the interval.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldbook_core::environment::Clock;
use fieldbook_core::error::HandlerError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// One kind of deadline scan.
#[async_trait]
pub trait Sweep: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Resolve everything whose deadline is at or before `now`.
    ///
    /// Returns the number of records resolved.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] when storage or the bus fails mid-pass; the
    /// next pass picks up whatever was left.
    async fn run(&self, now: DateTime<Utc>) -> Result<usize, HandlerError>;
}

/// Runs a set of sweeps on a fixed interval until shutdown.
pub struct Sweeper {
    sweeps: Vec<Arc<dyn Sweep>>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl Sweeper {
    /// Create a sweeper with no sweeps registered.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, interval: Duration, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            sweeps: Vec::new(),
            clock,
            interval,
            shutdown,
        }
    }

    /// Register a sweep.
    #[must_use]
    pub fn with_sweep(mut self, sweep: Arc<dyn Sweep>) -> Self {
        self.sweeps.push(sweep);
        self
    }

    /// Run every sweep once at the current clock time.
    ///
    /// Failures are logged and do not stop the remaining sweeps.
    pub async fn tick(&self) -> usize {
        let now = self.clock.now();
        let mut resolved = 0;

        for sweep in &self.sweeps {
            match sweep.run(now).await {
                Ok(0) => debug!(sweep = sweep.name(), "Sweep found nothing to resolve"),
                Ok(count) => {
                    info!(sweep = sweep.name(), count, "Sweep resolved expired records");
                    metrics::counter!("sweep_resolved_total", "sweep" => sweep.name()).increment(count as u64);
                    resolved += count;
                }
                Err(e) => {
                    error!(sweep = sweep.name(), error = %e, "Sweep failed");
                    metrics::counter!("sweep_failures_total", "sweep" => sweep.name()).increment(1);
                }
            }
        }

        resolved
    }

    /// Spawn the sweep loop as a background task.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, sweeps = self.sweeps.len(), "Sweeper started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = self.shutdown.recv() => break,
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
            info!("Sweeper stopped");
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use fieldbook_core::environment::SystemClock;
    use std::sync::Mutex;

    struct Recording {
        seen: Mutex<Vec<DateTime<Utc>>>,
        result: Result<usize, HandlerError>,
    }

    #[async_trait]
    impl Sweep for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn run(&self, now: DateTime<Utc>) -> Result<usize, HandlerError> {
            self.seen.lock().unwrap().push(now);
            self.result.clone()
        }
    }

    #[tokio::test]
    async fn tick_sums_resolved_and_survives_failures() {
        let (_tx, rx) = broadcast::channel(1);
        let ok = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            result: Ok(3),
        });
        let failing = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            result: Err(HandlerError::transient("db down")),
        });
        let sweeper = Sweeper::new(Arc::new(SystemClock), Duration::from_secs(60), rx)
            .with_sweep(failing.clone())
            .with_sweep(ok.clone());

        assert_eq!(sweeper.tick().await, 3);
        assert_eq!(failing.seen.lock().unwrap().len(), 1);
        assert_eq!(ok.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn spawned_sweeper_stops_on_shutdown() {
        let (tx, rx) = broadcast::channel(1);
        let sweep = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            result: Ok(0),
        });
        let handle = Sweeper::new(Arc::new(SystemClock), Duration::from_millis(5), rx)
            .with_sweep(sweep.clone())
            .spawn();

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(!sweep.seen.lock().unwrap().is_empty());
    }
}
