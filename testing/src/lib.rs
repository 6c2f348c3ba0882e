//! # Fieldbook Testing
//!
//! Testing utilities for the Fieldbook services.
//!
//! This crate provides:
//! - Clocks that tests control ([`FixedClock`], [`ManualClock`])
//! - An in-memory [`InMemoryEventBus`] with per-key ordering, a publish log,
//!   re-delivery and publish-failure injection
//! - [`ReducerTest`], a Given-When-Then harness for state machines
//! - [`eventually`], for asserting on asynchronous outcomes
//!
//! ## Example
//!
//! ```ignore
//! use fieldbook_testing::{InMemoryEventBus, ManualClock, test_clock};
//!
//! #[tokio::test]
//! async fn hold_expires() {
//!     let clock = ManualClock::starting_at(test_clock().now());
//!     let bus = InMemoryEventBus::new();
//!     // ... wire services, then:
//!     clock.advance(chrono::Duration::minutes(11));
//!     sweep.run(clock.now()).await.unwrap();
//!     assert_eq!(bus.published_types("fieldbook.slot-events"), vec!["SlotHoldExpired.v1"]);
//! }
//! ```

use chrono::{DateTime, Utc};
use fieldbook_core::environment::Clock;
use std::future::Future;
use std::time::Duration;

pub mod event_bus;
pub mod reducer_test;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use fieldbook_testing::mocks::FixedClock;
    /// use fieldbook_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when a test moves it. Clones share the same time.
    ///
    /// ```
    /// use fieldbook_testing::mocks::ManualClock;
    /// use fieldbook_core::environment::Clock;
    ///
    /// let clock = ManualClock::starting_at(fieldbook_testing::test_clock().now());
    /// let before = clock.now();
    /// clock.advance(chrono::Duration::minutes(5));
    /// assert_eq!(clock.now() - before, chrono::Duration::minutes(5));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock reading `time`.
        #[must_use]
        pub fn starting_at(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward by `by`.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Set the clock to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// Never in practice: the timestamp is a valid constant.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Poll `condition` until it returns `true` or `timeout` elapses.
///
/// Returns whether the condition was met. Useful for assertions on work done
/// by background consumers.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// Re-export commonly used items
pub use event_bus::InMemoryEventBus;
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use reducer_test::ReducerTest;
