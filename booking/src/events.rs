//! Events exchanged between the services, and where they travel.
//!
//! | Event | Topic | Key |
//! |---|---|---|
//! | [`SlotHoldRequested`], [`SlotConfirmed`], [`SlotReleaseRequested`] | [`topics::SLOT_COMMANDS`] | slot id |
//! | [`SlotHeld`], [`SlotHoldFailed`], [`SlotHoldExpired`] | [`topics::SLOT_EVENTS`] | reservation id |
//! | [`PaymentRequested`] | [`topics::PAYMENT_REQUESTS`] | reservation id |
//! | [`PaymentSucceeded`], [`PaymentFailed`] | [`topics::PAYMENT_OUTCOMES`] | reservation id |
//!
//! Keying slot commands by slot serializes every command for one slot on one
//! Field Service worker. Keying everything else by reservation keeps each
//! reservation's history in order for the Order Service.

use crate::types::{Money, PaymentIntentId, ReservationId, SlotId};
use chrono::{DateTime, Utc};
use fieldbook_core::event::Event;
use serde::{Deserialize, Serialize};

/// Topic names.
pub mod topics {
    /// Commands for the Field Service, keyed by slot.
    pub const SLOT_COMMANDS: &str = "fieldbook.slot-commands";
    /// Slot ledger outcomes for the Order Service, keyed by reservation.
    pub const SLOT_EVENTS: &str = "fieldbook.slot-events";
    /// Payment requests for the Payment Service, keyed by reservation.
    pub const PAYMENT_REQUESTS: &str = "fieldbook.payment-requests";
    /// Settlement outcomes for the Order Service, keyed by reservation.
    pub const PAYMENT_OUTCOMES: &str = "fieldbook.payment-outcomes";
}

/// An event with a fixed topic and a partition key.
pub trait Routed: Event + Serialize {
    /// Topic the event is published to.
    const TOPIC: &'static str;

    /// Partition key.
    fn key(&self) -> String;
}

macro_rules! routed {
    ($event:ty, $type_name:literal, $topic:expr, |$this:ident| $key:expr) => {
        impl Event for $event {
            fn event_type(&self) -> &'static str {
                $type_name
            }
        }

        impl $event {
            /// The versioned type name carried in envelopes.
            pub const EVENT_TYPE: &'static str = $type_name;
        }

        impl Routed for $event {
            const TOPIC: &'static str = $topic;

            fn key(&self) -> String {
                let $this = self;
                $key.to_string()
            }
        }
    };
}

/// Order Service asks the Field Service to hold a slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotHoldRequested {
    /// Reservation asking for the hold
    pub reservation_id: ReservationId,
    /// Slot to hold
    pub slot_id: SlotId,
    /// Holder identity on the ledger (the reservation id)
    pub order_id: ReservationId,
    /// Hold time-to-live in seconds
    pub ttl_secs: u64,
    /// When the Order Service asked; stale requests are refused
    pub requested_at: DateTime<Utc>,
}

/// The slot is held for the reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotHeld {
    /// Reservation holding the slot
    pub reservation_id: ReservationId,
    /// Held slot
    pub slot_id: SlotId,
    /// Ledger version of the hold, needed to confirm or release it
    pub version: u64,
    /// When the hold lapses
    pub expires_at: DateTime<Utc>,
}

/// The slot could not be held.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotHoldFailed {
    /// Reservation that asked for the hold
    pub reservation_id: ReservationId,
    /// Requested slot
    pub slot_id: SlotId,
    /// Why the hold was refused
    pub reason: String,
}

/// A hold lapsed before it was confirmed and the slot is free again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotHoldExpired {
    /// Reservation whose hold lapsed
    pub reservation_id: ReservationId,
    /// Reclaimed slot
    pub slot_id: SlotId,
}

/// Order Service asks the Payment Service to collect payment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequested {
    /// Reservation being paid for
    pub reservation_id: ReservationId,
    /// Amount to collect
    pub amount: Money,
    /// Key the gateway uses to collapse repeated charge attempts
    pub idempotency_key: String,
}

/// Payment was collected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSucceeded {
    /// Paid reservation
    pub reservation_id: ReservationId,
    /// Settled payment intent
    pub payment_id: PaymentIntentId,
    /// Gateway reference of the charge
    pub gateway_ref: String,
}

/// Payment could not be collected, or settlement timed out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailed {
    /// Unpaid reservation
    pub reservation_id: ReservationId,
    /// Failed payment intent, if one was created
    pub payment_id: Option<PaymentIntentId>,
    /// Failure reason
    pub reason: String,
}

/// Order Service tells the Field Service the slot is paid for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfirmed {
    /// Slot to book
    pub slot_id: SlotId,
    /// Reservation holding it
    pub reservation_id: ReservationId,
    /// Hold version from [`SlotHeld`]
    pub version: u64,
}

/// Order Service gives the slot back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotReleaseRequested {
    /// Slot to free
    pub slot_id: SlotId,
    /// Reservation holding it
    pub reservation_id: ReservationId,
    /// Hold version from [`SlotHeld`]
    pub version: u64,
}

routed!(SlotHoldRequested, "SlotHoldRequested.v1", topics::SLOT_COMMANDS, |e| e.slot_id);
routed!(SlotConfirmed, "SlotConfirmed.v1", topics::SLOT_COMMANDS, |e| e.slot_id);
routed!(SlotReleaseRequested, "SlotReleaseRequested.v1", topics::SLOT_COMMANDS, |e| e.slot_id);
routed!(SlotHeld, "SlotHeld.v1", topics::SLOT_EVENTS, |e| e.reservation_id);
routed!(SlotHoldFailed, "SlotHoldFailed.v1", topics::SLOT_EVENTS, |e| e.reservation_id);
routed!(SlotHoldExpired, "SlotHoldExpired.v1", topics::SLOT_EVENTS, |e| e.reservation_id);
routed!(PaymentRequested, "PaymentRequested.v1", topics::PAYMENT_REQUESTS, |e| e.reservation_id);
routed!(PaymentSucceeded, "PaymentSucceeded.v1", topics::PAYMENT_OUTCOMES, |e| e.reservation_id);
routed!(PaymentFailed, "PaymentFailed.v1", topics::PAYMENT_OUTCOMES, |e| e.reservation_id);

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use fieldbook_core::event::{EventEnvelope, EventId};

    #[test]
    fn slot_commands_are_keyed_by_slot() {
        let event = SlotConfirmed {
            slot_id: SlotId::new(),
            reservation_id: ReservationId::new(),
            version: 3,
        };
        assert_eq!(event.key(), event.slot_id.to_string());
        assert_eq!(SlotConfirmed::TOPIC, topics::SLOT_COMMANDS);
    }

    #[test]
    fn outcomes_are_keyed_by_reservation() {
        let event = PaymentFailed {
            reservation_id: ReservationId::new(),
            payment_id: None,
            reason: "card declined".into(),
        };
        assert_eq!(event.key(), event.reservation_id.to_string());
        assert_eq!(PaymentFailed::TOPIC, topics::PAYMENT_OUTCOMES);
    }

    #[test]
    fn envelope_carries_versioned_type() {
        let event = SlotHoldExpired {
            reservation_id: ReservationId::new(),
            slot_id: SlotId::new(),
        };
        let envelope =
            EventEnvelope::seal(EventId::new(), event.key(), &event, Utc::now(), None).unwrap();
        assert_eq!(envelope.event_type, SlotHoldExpired::EVENT_TYPE);
        assert_eq!(envelope.open::<SlotHoldExpired>().unwrap(), event);
    }
}
