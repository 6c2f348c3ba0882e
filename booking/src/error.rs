//! Error taxonomy of the booking services.
//!
//! Losing a race for a slot or letting a hold lapse are ordinary outcomes and
//! travel as values (`HoldOutcome::Conflict`, `ReservationStatus::HoldExpired`).
//! The errors here are for work that could not be done:
//!
//! | Kind | Meaning | Consumer reaction |
//! |---|---|---|
//! | `Conflict` | a request collides with existing state | dead-letter |
//! | `Transient` | storage, bus or gateway unavailable | retry with backoff |
//! | `Expired` | a deadline passed before the work ran | dead-letter |
//! | `Invalid` | malformed input, unknown aggregate | dead-letter |
//! | `Fatal` | broken invariant or configuration | dead-letter, page someone |

use fieldbook_core::error::HandlerError;
use fieldbook_core::event::EventError;
use fieldbook_core::event_bus::EventBusError;
use thiserror::Error;

/// Errors from booking operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// The request collides with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A dependency was unavailable; retrying can succeed.
    #[error("temporarily unavailable: {0}")]
    Transient(String),

    /// A deadline passed before the work could run.
    #[error("expired: {0}")]
    Expired(String),

    /// The input is malformed.
    #[error("invalid: {0}")]
    Invalid(String),

    /// The referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An invariant was broken.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl BookingError {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "conflict",
            Self::Transient(_) => "transient",
            Self::Expired(_) => "expired",
            Self::Invalid(_) => "invalid",
            Self::NotFound(_) => "not_found",
            Self::Fatal(_) => "fatal",
        }
    }
}

impl From<BookingError> for HandlerError {
    fn from(error: BookingError) -> Self {
        match error {
            BookingError::Transient(reason) => Self::Transient(reason),
            BookingError::Fatal(reason) => Self::Fatal(reason),
            other @ (BookingError::Conflict(_)
            | BookingError::Expired(_)
            | BookingError::Invalid(_)
            | BookingError::NotFound(_)) => Self::Invalid(other.to_string()),
        }
    }
}

impl From<EventBusError> for BookingError {
    fn from(error: EventBusError) -> Self {
        if error.is_transient() {
            Self::Transient(error.to_string())
        } else {
            Self::Invalid(error.to_string())
        }
    }
}

impl From<EventError> for BookingError {
    fn from(error: EventError) -> Self {
        match error {
            EventError::SerializationError(reason) => Self::Fatal(reason),
            other => Self::Invalid(other.to_string()),
        }
    }
}

/// Errors from the reservation and payment intent repositories.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// A record with the same idempotency key already exists.
    #[error("duplicate idempotency key: {0}")]
    Duplicate(String),

    /// The record changed since it was read.
    #[error("record {0} was modified concurrently")]
    StaleWrite(String),

    /// The record does not exist.
    #[error("record {0} not found")]
    NotFound(String),

    /// The backing store failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<RepositoryError> for BookingError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Duplicate(key) => Self::Conflict(format!("idempotency key {key} already used")),
            RepositoryError::NotFound(id) => Self::NotFound(id),
            RepositoryError::StaleWrite(_) | RepositoryError::Storage(_) => {
                Self::Transient(error.to_string())
            }
        }
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(error: sqlx::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retried_by_consumers() {
        let transient: HandlerError = BookingError::Transient("db down".into()).into();
        assert!(transient.is_retryable());

        for error in [
            BookingError::Conflict("x".into()),
            BookingError::Expired("x".into()),
            BookingError::Invalid("x".into()),
            BookingError::NotFound("x".into()),
        ] {
            let handler: HandlerError = error.into();
            assert_eq!(handler.kind(), "invalid");
        }

        let fatal: HandlerError = BookingError::Fatal("x".into()).into();
        assert_eq!(fatal.kind(), "fatal");
    }

    #[test]
    fn stale_writes_are_retried() {
        let error: BookingError = RepositoryError::StaleWrite("r-1".into()).into();
        assert_eq!(error.kind(), "transient");
    }

    #[test]
    fn duplicate_key_is_a_conflict() {
        let error: BookingError = RepositoryError::Duplicate("k".into()).into();
        assert_eq!(error.kind(), "conflict");
    }
}
