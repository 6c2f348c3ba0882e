//! The reservation state machine as a pure reducer.

use super::{Reservation, ReservationStatus};
use crate::error::BookingError;
use crate::events::{PaymentRequested, SlotConfirmed, SlotHoldRequested, SlotReleaseRequested};
use crate::publisher::Outgoing;
use crate::types::PaymentIntentId;
use chrono::{DateTime, Duration, Utc};
use fieldbook_core::environment::Clock;
use fieldbook_core::event::EventId;
use fieldbook_core::reducer::{Effects, Reducer};
use smallvec::smallvec;
use std::sync::Arc;

/// Inputs of the reservation state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReservationAction {
    /// The field service holds the slot.
    SlotHeld {
        /// Inbound event id
        event_id: EventId,
        /// Hold version on the ledger
        version: u64,
        /// When the hold lapses
        expires_at: DateTime<Utc>,
    },
    /// The field service refused the hold.
    SlotHoldFailed {
        /// Inbound event id
        event_id: EventId,
        /// Refusal reason
        reason: String,
    },
    /// The hold lapsed and the slot was reclaimed.
    SlotHoldExpired {
        /// Inbound event id
        event_id: EventId,
    },
    /// The payment request is on its way; start the payment clock.
    PaymentRequestStaged,
    /// Payment was collected.
    PaymentSucceeded {
        /// Inbound event id
        event_id: EventId,
        /// Settled intent
        payment_id: PaymentIntentId,
        /// Gateway reference
        gateway_ref: String,
    },
    /// Payment failed.
    PaymentFailed {
        /// Inbound event id
        event_id: EventId,
        /// Failed intent, if any
        payment_id: Option<PaymentIntentId>,
        /// Failure reason
        reason: String,
    },
    /// No payment outcome arrived before the deadline.
    PaymentTimedOut {
        /// Id identifying this timeout
        event_id: EventId,
    },
}

impl ReservationAction {
    /// Id of the inbound event, for actions that come from one.
    #[must_use]
    pub const fn event_id(&self) -> Option<EventId> {
        match self {
            Self::SlotHeld { event_id, .. }
            | Self::SlotHoldFailed { event_id, .. }
            | Self::SlotHoldExpired { event_id }
            | Self::PaymentSucceeded { event_id, .. }
            | Self::PaymentFailed { event_id, .. }
            | Self::PaymentTimedOut { event_id } => Some(*event_id),
            Self::PaymentRequestStaged => None,
        }
    }

    /// Id of the timeout action of a reservation. Stable across sweeps.
    #[must_use]
    pub fn timeout_event_id(reservation: &Reservation) -> EventId {
        EventId::derive(reservation.id.as_cause(), "payment-timeout")
    }
}

/// Outputs of the reservation state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReservationEffect {
    /// Ask the field service to hold the slot.
    RequestHold {
        /// Outbound event id
        event_id: EventId,
        /// Command
        event: SlotHoldRequested,
    },
    /// Ask the payment service to collect payment.
    RequestPayment {
        /// Outbound event id
        event_id: EventId,
        /// Command
        event: PaymentRequested,
    },
    /// Tell the field service the slot is paid for.
    ConfirmSlot {
        /// Outbound event id
        event_id: EventId,
        /// Command
        event: SlotConfirmed,
    },
    /// Give the slot back.
    ReleaseSlot {
        /// Outbound event id
        event_id: EventId,
        /// Command
        event: SlotReleaseRequested,
    },
    /// Feed an action back into the reducer once the other effects are staged.
    Feedback(ReservationAction),
}

impl ReservationEffect {
    /// Seal the outbound event, `None` for feedback.
    ///
    /// # Errors
    ///
    /// [`BookingError::Fatal`] if the event cannot be encoded.
    pub fn seal(&self, now: DateTime<Utc>, cause: Option<EventId>) -> Result<Option<Outgoing>, BookingError> {
        let outgoing = match self {
            Self::RequestHold { event_id, event } => Outgoing::seal(*event_id, event, now, cause)?,
            Self::RequestPayment { event_id, event } => Outgoing::seal(*event_id, event, now, cause)?,
            Self::ConfirmSlot { event_id, event } => Outgoing::seal(*event_id, event, now, cause)?,
            Self::ReleaseSlot { event_id, event } => Outgoing::seal(*event_id, event, now, cause)?,
            Self::Feedback(_) => return Ok(None),
        };
        Ok(Some(outgoing))
    }
}

/// Dependencies of the reducer.
#[derive(Clone)]
pub struct ReservationEnvironment {
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Hold TTL requested from the field service
    pub hold_ttl: Duration,
    /// How long to wait for a payment outcome
    pub payment_timeout: Duration,
}

/// The reservation state machine.
///
/// Total over `(status, action)`: pairs without a transition leave the
/// reservation untouched and emit nothing. An action carrying the id of the
/// last applied event is a re-delivery; it re-emits what the current status
/// implies, with the same outbound event ids as the first time.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReservationReducer;

impl ReservationReducer {
    /// Effects the current status stands for.
    ///
    /// Outbound ids derive from the last applied event, so re-emitting them
    /// after a crash produces envelopes downstream consumers already know.
    #[must_use]
    pub fn implied_effects(reservation: &Reservation, env: &ReservationEnvironment) -> Effects<ReservationEffect> {
        let cause = reservation.last_event_id.unwrap_or_else(|| reservation.id.as_cause());
        let id = |event_type: &str| EventId::derive(cause, event_type);

        match reservation.status {
            ReservationStatus::PendingHold => smallvec![ReservationEffect::RequestHold {
                event_id: id(SlotHoldRequested::EVENT_TYPE),
                event: SlotHoldRequested {
                    reservation_id: reservation.id,
                    slot_id: reservation.slot_id,
                    order_id: reservation.id,
                    ttl_secs: u64::try_from(env.hold_ttl.num_seconds()).unwrap_or_default(),
                    requested_at: reservation.created_at,
                },
            }],
            ReservationStatus::HoldConfirmed => smallvec![
                Self::request_payment(reservation, id(PaymentRequested::EVENT_TYPE)),
                ReservationEffect::Feedback(ReservationAction::PaymentRequestStaged),
            ],
            ReservationStatus::PaymentPending => {
                smallvec![Self::request_payment(reservation, id(PaymentRequested::EVENT_TYPE))]
            }
            ReservationStatus::Confirmed => reservation
                .hold_version
                .map(|version| ReservationEffect::ConfirmSlot {
                    event_id: id(SlotConfirmed::EVENT_TYPE),
                    event: SlotConfirmed {
                        slot_id: reservation.slot_id,
                        reservation_id: reservation.id,
                        version,
                    },
                })
                .into_iter()
                .collect(),
            ReservationStatus::PaymentFailed => reservation
                .hold_version
                .map(|version| ReservationEffect::ReleaseSlot {
                    event_id: id(SlotReleaseRequested::EVENT_TYPE),
                    event: SlotReleaseRequested {
                        slot_id: reservation.slot_id,
                        reservation_id: reservation.id,
                        version,
                    },
                })
                .into_iter()
                .collect(),
            ReservationStatus::HoldExpired | ReservationStatus::Rejected => Effects::new(),
        }
    }

    fn request_payment(reservation: &Reservation, event_id: EventId) -> ReservationEffect {
        ReservationEffect::RequestPayment {
            event_id,
            event: PaymentRequested {
                reservation_id: reservation.id,
                amount: reservation.amount.clone(),
                idempotency_key: reservation.payment_idempotency_key(),
            },
        }
    }
}

impl Reducer for ReservationReducer {
    type State = Reservation;
    type Action = ReservationAction;
    type Environment = ReservationEnvironment;
    type Effect = ReservationEffect;

    fn reduce(&self, r: &mut Reservation, action: ReservationAction, env: &ReservationEnvironment) -> Effects<ReservationEffect> {
        use ReservationStatus as S;

        if action.event_id().is_some() && action.event_id() == r.last_event_id {
            return Self::implied_effects(r, env);
        }

        let now = env.clock.now();
        let next = match (r.status, action) {
            (
                S::PendingHold,
                ReservationAction::SlotHeld {
                    event_id,
                    version,
                    expires_at,
                },
            ) => {
                r.hold_version = Some(version);
                // Caps the payment deadline: payment after the hold lapsed cannot book the slot.
                r.payment_deadline = Some(expires_at);
                r.last_event_id = Some(event_id);
                S::HoldConfirmed
            }
            (S::HoldConfirmed, ReservationAction::PaymentRequestStaged) => {
                let by_timeout = now + env.payment_timeout;
                r.payment_deadline = Some(r.payment_deadline.map_or(by_timeout, |cap| cap.min(by_timeout)));
                S::PaymentPending
            }
            (S::PendingHold, ReservationAction::SlotHoldFailed { event_id, reason }) => {
                r.failure_reason = Some(reason);
                r.last_event_id = Some(event_id);
                S::Rejected
            }
            (S::PendingHold | S::HoldConfirmed | S::PaymentPending, ReservationAction::SlotHoldExpired { event_id }) => {
                r.failure_reason = Some("hold expired".to_string());
                r.last_event_id = Some(event_id);
                S::HoldExpired
            }
            (
                S::PaymentPending,
                ReservationAction::PaymentSucceeded {
                    event_id,
                    payment_id,
                    gateway_ref,
                },
            ) if r.payment_deadline.is_some_and(|deadline| deadline <= now) => {
                r.payment_id = Some(payment_id);
                r.gateway_ref = Some(gateway_ref);
                r.failure_reason = Some("payment arrived after the deadline".to_string());
                r.last_event_id = Some(event_id);
                S::PaymentFailed
            }
            (
                S::PaymentPending,
                ReservationAction::PaymentSucceeded {
                    event_id,
                    payment_id,
                    gateway_ref,
                },
            ) => {
                r.payment_id = Some(payment_id);
                r.gateway_ref = Some(gateway_ref);
                r.last_event_id = Some(event_id);
                S::Confirmed
            }
            (
                S::PaymentPending,
                ReservationAction::PaymentFailed {
                    event_id,
                    payment_id,
                    reason,
                },
            ) => {
                r.payment_id = payment_id;
                r.failure_reason = Some(reason);
                r.last_event_id = Some(event_id);
                S::PaymentFailed
            }
            (S::PaymentPending, ReservationAction::PaymentTimedOut { event_id }) => {
                r.failure_reason = Some("payment timed out".to_string());
                r.last_event_id = Some(event_id);
                S::PaymentFailed
            }
            _ => return Effects::new(),
        };

        r.enter(next, now);
        if next == S::PaymentPending {
            // The request went out with the hold confirmation.
            return Effects::new();
        }
        Self::implied_effects(r, env)
    }
}
