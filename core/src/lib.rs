//! # Fieldbook Core
//!
//! Core traits and types shared by the Fieldbook booking services.
//!
//! The booking flow is choreographed over an event bus: each service owns its
//! aggregate (slots, reservations, payment intents), reacts to typed events,
//! and publishes the consequences. This crate holds the pieces every service
//! needs to take part in that choreography:
//!
//! - [`event`]: the [`Event`](event::Event) trait and the [`EventEnvelope`](event::EventEnvelope) wire format
//! - [`event_bus`]: the [`EventBus`](event_bus::EventBus) transport trait
//! - [`inbox`]: per-consumer dedup markers for at-least-once delivery
//! - [`error`]: the handler failure taxonomy
//! - [`reducer`]: pure state machines `(State, Action, Environment) → Effects`
//! - [`environment`]: injected dependencies such as the [`Clock`](environment::Clock)
//!
//! ## Architecture Principles
//!
//! - Functional core, imperative shell: state machines are pure, services do I/O
//! - Effects are values returned by reducers, executed by the caller
//! - Time is injected, never read from the system inside domain logic

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod error;
pub mod event;
pub mod event_bus;
pub mod inbox;

/// Reducer module - pure state machines.
///
/// A reducer decides, for the current state and one input, what the next
/// state is and which effects must follow. It performs no I/O: effects are
/// plain values the caller executes once the new state is persisted.
pub mod reducer {
    use smallvec::SmallVec;

    /// Effects returned from one reduction. Most transitions emit at most one.
    pub type Effects<E> = SmallVec<[E; 4]>;

    /// The Reducer trait - core abstraction for business logic
    ///
    /// # Example
    ///
    /// ```
    /// use fieldbook_core::reducer::{Effects, Reducer};
    /// use smallvec::smallvec;
    ///
    /// struct Turnstile;
    ///
    /// impl Reducer for Turnstile {
    ///     type State = bool;
    ///     type Action = ();
    ///     type Environment = ();
    ///     type Effect = &'static str;
    ///
    ///     fn reduce(&self, locked: &mut bool, _: (), _: &()) -> Effects<&'static str> {
    ///         *locked = !*locked;
    ///         smallvec![if *locked { "locked" } else { "unlocked" }]
    ///     }
    /// }
    ///
    /// let mut state = true;
    /// assert_eq!(Turnstile.reduce(&mut state, (), &()).as_slice(), &["unlocked"]);
    /// ```
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// The effect descriptions this reducer produces
        type Effect;

        /// Reduce an action into state changes and effects.
        ///
        /// Must be total: every `(state, action)` pair yields a result, even if
        /// that result is "no change, no effects".
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> Effects<Self::Effect>;
    }
}

/// Environment module - Dependency injection traits
///
/// All external dependencies are abstracted behind traits and injected
/// via the Environment parameter.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Hold TTLs, payment deadlines and sweeps all read time through this
    /// trait so tests can move time explicitly.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
