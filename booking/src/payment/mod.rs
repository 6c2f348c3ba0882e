//! Payment Settlement Adapter, owned by the payment service.
//!
//! One [`PaymentIntent`] per payment request. Every charge attempt for an
//! intent carries the same idempotency key, so the gateway collapses
//! retries into one charge. Only the first gateway callback for an intent
//! moves it to a final status; later callbacks re-announce that status.

mod adapter;
mod gateway;
mod handler;
mod postgres;
mod repository;
mod signature;
mod sweep;

pub use adapter::{CallbackOutcome, CallbackStatus, GatewayCallback, SettlementAdapter, WebhookError};
pub use gateway::{ChargeReceipt, ChargeRequest, GatewayError, HttpPaymentGateway, MockPaymentGateway, PaymentGateway};
pub use handler::PaymentRequestHandler;
pub use postgres::PostgresPaymentIntentRepository;
pub use repository::{InMemoryPaymentIntentRepository, PaymentIntentRepository};
pub use signature::{CallbackVerifier, SignatureError};
pub use sweep::SettlementExpirySweep;

use crate::types::{Money, PaymentIntentId, ReservationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Consumer name of the payment service, used for its inbox and dead letters.
pub const CONSUMER: &str = "payment-service";

/// Lifecycle status of a payment intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Stored, gateway not called yet
    Created,
    /// Charge accepted by the gateway, waiting for its callback
    Settling,
    /// Paid
    Succeeded,
    /// Declined or failed
    Failed,
    /// No callback before the settlement deadline
    Expired,
}

impl PaymentStatus {
    /// Final statuses never change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Expired)
    }

    /// Stored representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Settling => "SETTLING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Parse the stored representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        [Self::Created, Self::Settling, Self::Succeeded, Self::Failed, Self::Expired]
            .into_iter()
            .find(|status| status.as_str() == s)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the gateway settled a charge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// Money collected
    Succeeded,
    /// Charge failed
    Failed {
        /// Gateway's reason
        reason: String,
    },
}

/// One attempt to collect payment for a reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Intent id
    pub id: PaymentIntentId,
    /// Reservation being paid for
    pub reservation_id: ReservationId,
    /// Amount to collect
    pub amount: Money,
    /// Current status
    pub status: PaymentStatus,
    /// Gateway's charge reference, known once the charge was accepted
    pub gateway_ref: Option<String>,
    /// Key sent with every charge attempt
    pub idempotency_key: String,
    /// When an unsettled intent expires
    pub settle_deadline: DateTime<Utc>,
    /// Why the payment failed
    pub failure_reason: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    /// A new intent in `CREATED`.
    #[must_use]
    pub fn new(
        reservation_id: ReservationId,
        amount: Money,
        idempotency_key: impl Into<String>,
        settle_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentIntentId::new(),
            reservation_id,
            amount,
            status: PaymentStatus::Created,
            gateway_ref: None,
            idempotency_key: idempotency_key.into(),
            settle_deadline,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn moved(&self, status: PaymentStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            updated_at: now,
            ..self.clone()
        }
    }

    /// `CREATED → SETTLING` once the gateway accepted the charge.
    #[must_use]
    pub fn settling(&self, gateway_ref: impl Into<String>, now: DateTime<Utc>) -> Option<Self> {
        (self.status == PaymentStatus::Created).then(|| Self {
            gateway_ref: Some(gateway_ref.into()),
            ..self.moved(PaymentStatus::Settling, now)
        })
    }

    /// `SETTLING → SUCCEEDED | FAILED` on the gateway callback.
    #[must_use]
    pub fn settle(&self, settlement: Settlement, now: DateTime<Utc>) -> Option<Self> {
        if self.status != PaymentStatus::Settling {
            return None;
        }
        Some(match settlement {
            Settlement::Succeeded => self.moved(PaymentStatus::Succeeded, now),
            Settlement::Failed { reason } => Self {
                failure_reason: Some(reason),
                ..self.moved(PaymentStatus::Failed, now)
            },
        })
    }

    /// `CREATED → FAILED` when the gateway declines the charge outright.
    #[must_use]
    pub fn decline(&self, reason: impl Into<String>, now: DateTime<Utc>) -> Option<Self> {
        (self.status == PaymentStatus::Created).then(|| Self {
            failure_reason: Some(reason.into()),
            ..self.moved(PaymentStatus::Failed, now)
        })
    }

    /// `CREATED | SETTLING → EXPIRED` past the settlement deadline.
    #[must_use]
    pub fn expire(&self, now: DateTime<Utc>) -> Option<Self> {
        (!self.status.is_terminal() && self.settle_deadline <= now).then(|| Self {
            failure_reason: Some("settlement timed out".to_string()),
            ..self.moved(PaymentStatus::Expired, now)
        })
    }
}
