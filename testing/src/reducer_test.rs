//! Ergonomic testing utilities for reducers
//!
//! This module provides a fluent API for testing reducers with readable Given-When-Then syntax.

#![allow(clippy::module_name_repetitions)] // ReducerTest is the natural name

use fieldbook_core::reducer::Reducer;

/// Type alias for state assertion functions
type StateAssertion<S> = Box<dyn FnOnce(&S)>;

/// Type alias for effect assertion functions
type EffectAssertion<F> = Box<dyn FnOnce(&[F])>;

/// Fluent API for testing reducers with Given-When-Then syntax
///
/// # Example
///
/// ```ignore
/// use fieldbook_testing::ReducerTest;
///
/// ReducerTest::new(ReservationReducer)
///     .with_env(test_env())
///     .given_state(pending_hold())
///     .when_action(ReservationAction::SlotHeld { .. })
///     .then_state(|r| assert_eq!(r.status, ReservationStatus::HoldConfirmed))
///     .then_effects(|effects| assert_eq!(effects.len(), 1))
///     .run();
/// ```
pub struct ReducerTest<R>
where
    R: Reducer,
{
    reducer: R,
    environment: Option<R::Environment>,
    initial_state: Option<R::State>,
    actions: Vec<R::Action>,
    state_assertions: Vec<StateAssertion<R::State>>,
    effect_assertions: Vec<EffectAssertion<R::Effect>>,
}

impl<R> ReducerTest<R>
where
    R: Reducer,
{
    /// Create a new reducer test with the given reducer
    #[must_use]
    pub const fn new(reducer: R) -> Self {
        Self {
            reducer,
            environment: None,
            initial_state: None,
            actions: Vec::new(),
            state_assertions: Vec::new(),
            effect_assertions: Vec::new(),
        }
    }

    /// Set the environment for the test
    #[must_use]
    pub fn with_env(mut self, env: R::Environment) -> Self {
        self.environment = Some(env);
        self
    }

    /// Set the initial state (Given)
    #[must_use]
    pub fn given_state(mut self, state: R::State) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Add an action to apply (When). Actions run in the order given.
    #[must_use]
    pub fn when_action(mut self, action: R::Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Add an assertion about the resulting state (Then)
    #[must_use]
    pub fn then_state<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&R::State) + 'static,
    {
        self.state_assertions.push(Box::new(assertion));
        self
    }

    /// Add an assertion about the effects of the last action (Then)
    #[must_use]
    pub fn then_effects<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&[R::Effect]) + 'static,
    {
        self.effect_assertions.push(Box::new(assertion));
        self
    }

    /// Run the test and execute all assertions
    ///
    /// # Panics
    ///
    /// Panics if initial state, action, or environment is not set,
    /// or if any assertions fail.
    #[allow(clippy::panic)] // Test code can panic
    #[allow(clippy::expect_used)] // Test code can use expect
    pub fn run(self) {
        let mut state = self
            .initial_state
            .expect("Initial state must be set with given_state()");
        let env = self
            .environment
            .expect("Environment must be set with with_env()");
        assert!(!self.actions.is_empty(), "At least one action must be set with when_action()");

        let mut effects = Vec::new();
        for action in self.actions {
            effects = self.reducer.reduce(&mut state, action, &env).into_vec();
        }

        for assertion in self.state_assertions {
            assertion(&state);
        }
        for assertion in self.effect_assertions {
            assertion(&effects);
        }
    }
}

/// Helper assertions for effects
pub mod assertions {
    /// Assert that there are no effects
    ///
    /// # Panics
    ///
    /// Panics if effects is not empty.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_no_effects<F: std::fmt::Debug>(effects: &[F]) {
        assert!(
            effects.is_empty(),
            "Expected no effects, but found {}: {:?}",
            effects.len(),
            effects
        );
    }

    /// Assert the number of effects
    ///
    /// # Panics
    ///
    /// Panics if the number of effects doesn't match expected.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_effects_count<F: std::fmt::Debug>(effects: &[F], expected: usize) {
        assert_eq!(
            effects.len(),
            expected,
            "Expected {expected} effects, but found {}: {effects:?}",
            effects.len(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldbook_core::reducer::Effects;
    use smallvec::smallvec;

    #[derive(Debug, PartialEq)]
    enum Light {
        Green,
        Yellow,
        Red,
    }

    struct TrafficLight;

    impl Reducer for TrafficLight {
        type State = Light;
        type Action = ();
        type Environment = ();
        type Effect = &'static str;

        fn reduce(&self, state: &mut Light, _: (), _: &()) -> Effects<&'static str> {
            *state = match state {
                Light::Green => Light::Yellow,
                Light::Yellow => Light::Red,
                Light::Red => return smallvec![],
            };
            smallvec!["changed"]
        }
    }

    #[test]
    fn single_action() {
        ReducerTest::new(TrafficLight)
            .with_env(())
            .given_state(Light::Green)
            .when_action(())
            .then_state(|light| assert_eq!(*light, Light::Yellow))
            .then_effects(|effects| assertions::assert_effects_count(effects, 1))
            .run();
    }

    #[test]
    fn effects_come_from_last_action() {
        ReducerTest::new(TrafficLight)
            .with_env(())
            .given_state(Light::Yellow)
            .when_action(())
            .when_action(())
            .then_state(|light| assert_eq!(*light, Light::Red))
            .then_effects(assertions::assert_no_effects)
            .run();
    }
}
