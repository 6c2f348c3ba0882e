//! The slot record and its transitions.
//!
//! Transitions are pure: they take the current record and return the
//! outcome together with the record to write, if any. Ledgers apply the
//! write with a compare-and-set on the version they read.

use crate::types::{FieldId, ReservationId, SlotId, TimeRange};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ledger status of a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    /// Nobody holds the slot
    Free,
    /// Claimed by a reservation until `hold_expires_at`
    Held,
    /// Paid for
    Booked,
}

impl SlotStatus {
    /// Stored representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Held => "HELD",
            Self::Booked => "BOOKED",
        }
    }

    /// Parse the stored representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FREE" => Some(Self::Free),
            "HELD" => Some(Self::Held),
            "BOOKED" => Some(Self::Booked),
            _ => None,
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bookable (field, time range) and who holds it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    /// Slot id
    pub id: SlotId,
    /// Field the slot belongs to
    pub field_id: FieldId,
    /// When the slot can be played
    pub time: TimeRange,
    /// Current status
    pub status: SlotStatus,
    /// Reservation holding or owning the slot
    pub holder: Option<ReservationId>,
    /// When the current hold lapses; kept after booking for the record
    pub hold_expires_at: Option<DateTime<Utc>>,
    /// Bumped by every change of holder
    pub version: u64,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

/// Result of [`Slot::hold`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldOutcome {
    /// The caller holds the slot at `version` until `expires_at`.
    Held {
        /// Version to confirm or release with
        version: u64,
        /// When the hold lapses
        expires_at: DateTime<Utc>,
        /// Lapsed hold of another reservation this hold replaced
        displaced: Option<ReclaimedHold>,
    },
    /// Someone else holds or booked the slot.
    Conflict,
    /// No such slot.
    NotFound,
}

impl HoldOutcome {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Held { .. } => "held",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
        }
    }
}

/// Result of [`Slot::confirm`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmOutcome {
    /// The slot is booked by the caller.
    Booked,
    /// Holder or version do not match.
    Conflict,
    /// No such slot.
    NotFound,
}

/// Result of [`Slot::release`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseOutcome {
    /// The caller's hold was dropped.
    Freed,
    /// Nothing held the slot.
    AlreadyFree,
    /// Someone else holds the slot, or it is booked; the release is stale.
    Conflict,
    /// No such slot.
    NotFound,
}

/// An expired hold, reclaimed by the sweep or taken over by a new hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimedHold {
    /// Reclaimed slot
    pub slot_id: SlotId,
    /// Reservation whose hold lapsed
    pub holder: ReservationId,
    /// Version the hold had
    pub hold_version: u64,
}

/// An outcome and the record to store for it.
///
/// `next` is `None` when the outcome needs no write (a conflict or an
/// idempotent replay).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision<O> {
    /// What the caller is told
    pub outcome: O,
    /// Record to compare-and-set over the current one
    pub next: Option<Slot>,
}

impl<O> Decision<O> {
    const fn unchanged(outcome: O) -> Self {
        Self { outcome, next: None }
    }
}

impl Slot {
    /// A free slot at version 0.
    #[must_use]
    pub const fn new(id: SlotId, field_id: FieldId, time: TimeRange, now: DateTime<Utc>) -> Self {
        Self {
            id,
            field_id,
            time,
            status: SlotStatus::Free,
            holder: None,
            hold_expires_at: None,
            version: 0,
            updated_at: now,
        }
    }

    /// Whether a hold exists and has not lapsed at `now`.
    #[must_use]
    pub fn has_live_hold(&self, now: DateTime<Utc>) -> bool {
        self.status == SlotStatus::Held && self.hold_expires_at.is_some_and(|at| at > now)
    }

    /// Whether the slot is held (live or lapsed) by `order_id` at `version`.
    #[must_use]
    pub fn is_held_by(&self, order_id: ReservationId, version: u64) -> bool {
        self.status == SlotStatus::Held && self.holder == Some(order_id) && self.version == version
    }

    /// Claim the slot for `order_id` until `now + ttl`.
    ///
    /// A free slot or a lapsed hold can be taken. Taking over another
    /// reservation's lapsed hold reports it as `displaced`, so its owner can
    /// be told. Asking again while holding (or owning) the slot repeats the
    /// original answer.
    #[must_use]
    pub fn hold(&self, order_id: ReservationId, ttl: Duration, now: DateTime<Utc>) -> Decision<HoldOutcome> {
        let replay = || HoldOutcome::Held {
            version: self.version,
            expires_at: self.hold_expires_at.unwrap_or(now),
            displaced: None,
        };

        match self.status {
            SlotStatus::Held if self.has_live_hold(now) => {
                if self.holder == Some(order_id) {
                    Decision::unchanged(replay())
                } else {
                    Decision::unchanged(HoldOutcome::Conflict)
                }
            }
            SlotStatus::Booked if self.holder == Some(order_id) => Decision::unchanged(replay()),
            SlotStatus::Booked => Decision::unchanged(HoldOutcome::Conflict),
            SlotStatus::Free | SlotStatus::Held => {
                let expires_at = now + ttl;
                let version = self.version + 1;
                let displaced = self
                    .holder
                    .filter(|holder| self.status == SlotStatus::Held && *holder != order_id)
                    .map(|holder| ReclaimedHold {
                        slot_id: self.id,
                        holder,
                        hold_version: self.version,
                    });
                Decision {
                    outcome: HoldOutcome::Held {
                        version,
                        expires_at,
                        displaced,
                    },
                    next: Some(Self {
                        status: SlotStatus::Held,
                        holder: Some(order_id),
                        hold_expires_at: Some(expires_at),
                        version,
                        updated_at: now,
                        ..self.clone()
                    }),
                }
            }
        }
    }

    /// Book a slot held by `order_id` at `expected_version`.
    ///
    /// A lapsed hold can still be confirmed while the sweep has not
    /// reclaimed it: the version proves nobody else took the slot since.
    /// The version is not bumped, so a repeated confirm answers `Booked`.
    #[must_use]
    pub fn confirm(&self, order_id: ReservationId, expected_version: u64, now: DateTime<Utc>) -> Decision<ConfirmOutcome> {
        let owned = self.holder == Some(order_id) && self.version == expected_version;
        match self.status {
            SlotStatus::Held if owned => Decision {
                outcome: ConfirmOutcome::Booked,
                next: Some(Self {
                    status: SlotStatus::Booked,
                    updated_at: now,
                    ..self.clone()
                }),
            },
            SlotStatus::Booked if owned => Decision::unchanged(ConfirmOutcome::Booked),
            _ => Decision::unchanged(ConfirmOutcome::Conflict),
        }
    }

    /// Drop the hold of `order_id` at `expected_version`.
    #[must_use]
    pub fn release(&self, order_id: ReservationId, expected_version: u64, now: DateTime<Utc>) -> Decision<ReleaseOutcome> {
        match self.status {
            SlotStatus::Free => Decision::unchanged(ReleaseOutcome::AlreadyFree),
            SlotStatus::Held if self.is_held_by(order_id, expected_version) => Decision {
                outcome: ReleaseOutcome::Freed,
                next: Some(self.freed(now)),
            },
            SlotStatus::Held | SlotStatus::Booked => Decision::unchanged(ReleaseOutcome::Conflict),
        }
    }

    /// Free the slot if its hold lapsed at or before `now`.
    #[must_use]
    pub fn reclaim(&self, now: DateTime<Utc>) -> Option<(ReclaimedHold, Self)> {
        if self.status != SlotStatus::Held || self.has_live_hold(now) {
            return None;
        }
        let holder = self.holder?;
        Some((
            ReclaimedHold {
                slot_id: self.id,
                holder,
                hold_version: self.version,
            },
            self.freed(now),
        ))
    }

    fn freed(&self, now: DateTime<Utc>) -> Self {
        Self {
            status: SlotStatus::Free,
            holder: None,
            hold_expires_at: None,
            version: self.version + 1,
            updated_at: now,
            ..self.clone()
        }
    }
}
