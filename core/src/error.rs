//! Failure taxonomy for event handlers.
//!
//! Business outcomes such as losing a race for a slot or a hold expiring are
//! *values* in the domain and never reach this type. A [`HandlerError`] means
//! the handler could not finish its work, and its variant tells the consumer
//! what to do about it:
//!
//! | Variant | Consumer reaction |
//! |---|---|
//! | `Transient` | retry with backoff, re-delivery is safe |
//! | `Invalid` | dead-letter the envelope and move on |
//! | `Fatal` | dead-letter the envelope and log loudly |

use thiserror::Error;

/// Why an event handler could not process an envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// A dependency (bus, database, gateway) was unavailable.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The envelope is malformed or cannot apply to any state.
    #[error("invalid event: {0}")]
    Invalid(String),

    /// An invariant was broken; the envelope needs operator attention.
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl HandlerError {
    /// Create a transient error.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    /// Create an invalid-event error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }

    /// Create a fatal error.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    /// Whether the consumer should retry the envelope.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Invalid(_) => "invalid",
            Self::Fatal(_) => "fatal",
        }
    }
}

impl From<crate::event::EventError> for HandlerError {
    fn from(error: crate::event::EventError) -> Self {
        match error {
            crate::event::EventError::SerializationError(reason) => Self::Fatal(reason),
            other => Self::Invalid(other.to_string()),
        }
    }
}

impl From<crate::event_bus::EventBusError> for HandlerError {
    fn from(error: crate::event_bus::EventBusError) -> Self {
        if error.is_transient() {
            Self::Transient(error.to_string())
        } else {
            Self::Invalid(error.to_string())
        }
    }
}

impl From<crate::inbox::InboxError> for HandlerError {
    fn from(error: crate::inbox::InboxError) -> Self {
        Self::Transient(error.to_string())
    }
}
