//! Reservation State Machine, owned by the order service.
//!
//! ```text
//! PENDING_HOLD ─SlotHeld→ HOLD_CONFIRMED ─(payment requested)→ PAYMENT_PENDING ─PaymentSucceeded→ CONFIRMED
//!      │                        │                                     ├─PaymentFailed / timeout→ PAYMENT_FAILED
//!      │                        └─────────────SlotHoldExpired─────────┴─────────────────────────→ HOLD_EXPIRED
//!      └─SlotHoldFailed→ REJECTED
//! ```
//!
//! Terminal reservations are kept forever and never change again.

mod handler;
mod postgres;
mod reducer;
mod repository;
mod service;
mod sweeps;

pub use handler::OrderEventHandler;
pub use postgres::PostgresReservationRepository;
pub use reducer::{ReservationAction, ReservationEffect, ReservationEnvironment, ReservationReducer};
pub use repository::{InMemoryReservationRepository, ReservationRepository};
pub use service::{BookingRequest, ReservationService};
pub use sweeps::{PaymentTimeoutSweep, ReconciliationSweep};

use crate::types::{Money, PaymentIntentId, ReservationId, SlotId, UserId};
use chrono::{DateTime, Utc};
use fieldbook_core::event::EventId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Consumer name of the order service, used for its inbox and dead letters.
pub const CONSUMER: &str = "order-service";

/// Lifecycle status of a reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Waiting for the field service to hold the slot
    PendingHold,
    /// Slot held; payment about to be requested
    HoldConfirmed,
    /// Waiting for a payment outcome
    PaymentPending,
    /// Paid and booked
    Confirmed,
    /// Payment failed or timed out
    PaymentFailed,
    /// The hold lapsed before payment completed
    HoldExpired,
    /// The slot could not be held
    Rejected,
}

impl ReservationStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::PendingHold,
        Self::HoldConfirmed,
        Self::PaymentPending,
        Self::Confirmed,
        Self::PaymentFailed,
        Self::HoldExpired,
        Self::Rejected,
    ];

    /// Terminal statuses never change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Confirmed | Self::PaymentFailed | Self::HoldExpired | Self::Rejected
        )
    }

    /// Stored representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingHold => "PENDING_HOLD",
            Self::HoldConfirmed => "HOLD_CONFIRMED",
            Self::PaymentPending => "PAYMENT_PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::PaymentFailed => "PAYMENT_FAILED",
            Self::HoldExpired => "HOLD_EXPIRED",
            Self::Rejected => "REJECTED",
        }
    }

    /// Parse the stored representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's attempt to book a slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation id, also the holder id on the slot ledger
    pub id: ReservationId,
    /// Requested slot
    pub slot_id: SlotId,
    /// Booking user
    pub user_id: UserId,
    /// Current status
    pub status: ReservationStatus,
    /// Client-supplied key that makes booking requests repeatable
    pub idempotency_key: String,
    /// Ledger version of the hold, known once the slot is held
    pub hold_version: Option<u64>,
    /// Settled payment intent
    pub payment_id: Option<PaymentIntentId>,
    /// Gateway reference of the settled charge
    pub gateway_ref: Option<String>,
    /// Price of the slot
    pub amount: Money,
    /// When an unanswered payment request times out
    pub payment_deadline: Option<DateTime<Utc>>,
    /// Why the reservation failed
    pub failure_reason: Option<String>,
    /// Last inbound event applied
    pub last_event_id: Option<EventId>,
    /// When each status was entered
    pub status_history: BTreeMap<ReservationStatus, DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    /// A new reservation waiting for its hold.
    #[must_use]
    pub fn new(
        slot_id: SlotId,
        user_id: UserId,
        idempotency_key: impl Into<String>,
        amount: Money,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReservationId::new(),
            slot_id,
            user_id,
            status: ReservationStatus::PendingHold,
            idempotency_key: idempotency_key.into(),
            hold_version: None,
            payment_id: None,
            gateway_ref: None,
            amount,
            payment_deadline: None,
            failure_reason: None,
            last_event_id: None,
            status_history: BTreeMap::from([(ReservationStatus::PendingHold, now)]),
            created_at: now,
            updated_at: now,
        }
    }

    /// Key every payment attempt for this reservation shares.
    #[must_use]
    pub fn payment_idempotency_key(&self) -> String {
        format!("{}:payment", self.id)
    }

    pub(crate) fn enter(&mut self, status: ReservationStatus, now: DateTime<Utc>) {
        self.status = status;
        self.status_history.insert(status, now);
        self.updated_at = now;
    }
}
