//! Slot Ledger: the field service's authoritative record of slot holds.
//!
//! Every write is a compare-and-set against the version that was read, so
//! concurrent hold attempts on one slot serialize without any lock that
//! spans more than that slot. Losing a race is an outcome
//! ([`HoldOutcome::Conflict`]), not an error.

mod memory;
mod postgres;
mod slot;
mod view;

pub use memory::InMemorySlotLedger;
pub use postgres::PostgresSlotLedger;
pub use slot::{ConfirmOutcome, Decision, HoldOutcome, ReclaimedHold, ReleaseOutcome, Slot, SlotStatus};
pub use view::{HttpSlotStatusView, SlotStatusView};

use crate::error::BookingError;
use crate::types::{ReservationId, SlotId};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

/// Errors from ledger storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A slot with this id already exists.
    #[error("slot {0} already exists")]
    Duplicate(SlotId),

    /// The backing store failed.
    #[error("ledger storage error: {0}")]
    Storage(String),
}

impl From<LedgerError> for BookingError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::Duplicate(_) => Self::Conflict(error.to_string()),
            LedgerError::Storage(_) => Self::Transient(error.to_string()),
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(error: sqlx::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

/// Storage of slots with atomic, version-checked transitions.
#[async_trait]
pub trait SlotLedger: Send + Sync {
    /// Register a new slot.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Duplicate`] if the id is taken.
    async fn create_slot(&self, slot: Slot) -> Result<(), LedgerError>;

    /// Current state of a slot.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] if the store is unavailable.
    async fn get(&self, slot_id: SlotId) -> Result<Option<Slot>, LedgerError>;

    /// Hold `slot_id` for `order_id` until `now + ttl`. See [`Slot::hold`].
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] if the store is unavailable.
    async fn try_hold(
        &self,
        slot_id: SlotId,
        order_id: ReservationId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<HoldOutcome, LedgerError>;

    /// Book a held slot. See [`Slot::confirm`].
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] if the store is unavailable.
    async fn confirm(
        &self,
        slot_id: SlotId,
        order_id: ReservationId,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<ConfirmOutcome, LedgerError>;

    /// Drop a hold. See [`Slot::release`].
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] if the store is unavailable.
    async fn release(
        &self,
        slot_id: SlotId,
        order_id: ReservationId,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, LedgerError>;

    /// Free up to `limit` holds that lapsed at or before `now`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] if the store is unavailable.
    async fn reclaim_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ReclaimedHold>, LedgerError>;
}
