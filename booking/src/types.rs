//! Identifiers and value objects shared by the three services.

use chrono::{DateTime, Utc};
use fieldbook_core::event::EventId;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Unique identifier for a bookable slot
    SlotId
);
id_type!(
    /// Unique identifier for a soccer field
    FieldId
);
id_type!(
    /// Unique identifier for a reservation.
    ///
    /// Also the holder identity (`order_id`) on the slot ledger.
    ReservationId
);
id_type!(
    /// Unique identifier for a user
    UserId
);
id_type!(
    /// Unique identifier for a payment intent
    PaymentIntentId
);

impl ReservationId {
    /// The id an event caused by this reservation's creation derives from.
    #[must_use]
    pub const fn as_cause(&self) -> EventId {
        EventId::from_uuid(self.0)
    }
}

/// An amount of money in minor units.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    /// Amount in cents (minor units)
    pub amount_cents: i64,
    /// ISO 4217 currency code, e.g. `"EUR"`
    pub currency: String,
}

impl Money {
    /// Create an amount.
    #[must_use]
    pub fn new(amount_cents: i64, currency: impl Into<String>) -> Self {
        Self {
            amount_cents,
            currency: currency.into(),
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:02} {}",
            self.amount_cents / 100,
            (self.amount_cents % 100).abs(),
            self.currency
        )
    }
}

/// Half-open time range `[starts_at, ends_at)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start (inclusive)
    pub starts_at: DateTime<Utc>,
    /// End (exclusive)
    pub ends_at: DateTime<Utc>,
}

impl TimeRange {
    /// Create a range, `None` unless `starts_at < ends_at`.
    #[must_use]
    pub fn new(starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Option<Self> {
        (starts_at < ends_at).then_some(Self { starts_at, ends_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn money_displays_minor_units() {
        assert_eq!(Money::new(4550, "EUR").to_string(), "45.50 EUR");
        assert_eq!(Money::new(7, "USD").to_string(), "0.07 USD");
    }

    #[test]
    fn time_range_rejects_empty_ranges() {
        let now = Utc::now();
        assert!(TimeRange::new(now, now).is_none());
        assert!(TimeRange::new(now, now - Duration::hours(1)).is_none());
        assert!(TimeRange::new(now, now + Duration::hours(1)).is_some());
    }

    #[test]
    fn ids_serialize_as_plain_uuids() {
        let id = SlotId::new();
        let json = serde_json::to_string(&id).unwrap_or_default();
        assert_eq!(json, format!("\"{id}\""));
    }
}
