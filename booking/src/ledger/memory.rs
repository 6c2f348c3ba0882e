//! In-memory slot ledger.

use super::{ConfirmOutcome, Decision, HoldOutcome, LedgerError, ReclaimedHold, ReleaseOutcome, Slot, SlotLedger};
use crate::types::{ReservationId, SlotId};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// [`SlotLedger`] in process memory.
///
/// Each slot sits behind its own mutex, so two holds on different slots
/// never wait for each other. The outer map lock is only taken to find or
/// insert a slot.
#[derive(Clone, Default)]
pub struct InMemorySlotLedger {
    slots: Arc<RwLock<HashMap<SlotId, Arc<Mutex<Slot>>>>>,
}

impl InMemorySlotLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, slot_id: SlotId) -> Option<Arc<Mutex<Slot>>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&slot_id)
            .cloned()
    }

    /// Run a transition on one slot and store its result.
    fn apply<O>(&self, slot_id: SlotId, decide: impl FnOnce(&Slot) -> Decision<O>) -> Option<O> {
        let entry = self.entry(slot_id)?;
        let mut slot = entry.lock().unwrap_or_else(PoisonError::into_inner);
        let Decision { outcome, next } = decide(&slot);
        if let Some(next) = next {
            *slot = next;
        }
        Some(outcome)
    }
}

#[async_trait]
impl SlotLedger for InMemorySlotLedger {
    async fn create_slot(&self, slot: Slot) -> Result<(), LedgerError> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if slots.contains_key(&slot.id) {
            return Err(LedgerError::Duplicate(slot.id));
        }
        slots.insert(slot.id, Arc::new(Mutex::new(slot)));
        Ok(())
    }

    async fn get(&self, slot_id: SlotId) -> Result<Option<Slot>, LedgerError> {
        Ok(self
            .entry(slot_id)
            .map(|entry| entry.lock().unwrap_or_else(PoisonError::into_inner).clone()))
    }

    async fn try_hold(
        &self,
        slot_id: SlotId,
        order_id: ReservationId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<HoldOutcome, LedgerError> {
        Ok(self
            .apply(slot_id, |slot| slot.hold(order_id, ttl, now))
            .unwrap_or(HoldOutcome::NotFound))
    }

    async fn confirm(
        &self,
        slot_id: SlotId,
        order_id: ReservationId,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<ConfirmOutcome, LedgerError> {
        Ok(self
            .apply(slot_id, |slot| slot.confirm(order_id, expected_version, now))
            .unwrap_or(ConfirmOutcome::NotFound))
    }

    async fn release(
        &self,
        slot_id: SlotId,
        order_id: ReservationId,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, LedgerError> {
        Ok(self
            .apply(slot_id, |slot| slot.release(order_id, expected_version, now))
            .unwrap_or(ReleaseOutcome::NotFound))
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ReclaimedHold>, LedgerError> {
        let entries: Vec<_> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut reclaimed = Vec::new();
        for entry in entries {
            if reclaimed.len() >= limit {
                break;
            }
            let mut slot = entry.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((hold, free)) = slot.reclaim(now) {
                *slot = free;
                reclaimed.push(hold);
            }
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ledger::SlotStatus;
    use crate::types::{FieldId, TimeRange};
    use fieldbook_testing::test_clock;
    use fieldbook_core::environment::Clock;

    async fn ledger_with_slot() -> (InMemorySlotLedger, SlotId) {
        let now = test_clock().now();
        let ledger = InMemorySlotLedger::new();
        let time = TimeRange::new(now + Duration::hours(2), now + Duration::hours(3)).unwrap();
        let slot = Slot::new(SlotId::new(), FieldId::new(), time, now);
        let id = slot.id;
        ledger.create_slot(slot).await.unwrap();
        (ledger, id)
    }

    #[tokio::test]
    async fn concurrent_holds_grant_exactly_one() {
        let (ledger, slot_id) = ledger_with_slot().await;
        let now = test_clock().now();

        let attempts: Vec<_> = (0..64)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .try_hold(slot_id, ReservationId::new(), Duration::minutes(10), now)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut held = 0;
        let mut conflicts = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                HoldOutcome::Held { version, .. } => {
                    assert_eq!(version, 1);
                    held += 1;
                }
                HoldOutcome::Conflict => conflicts += 1,
                HoldOutcome::NotFound => unreachable!("slot exists"),
            }
        }
        assert_eq!((held, conflicts), (1, 63));
    }

    #[tokio::test]
    async fn unknown_slots_are_reported() {
        let ledger = InMemorySlotLedger::new();
        let now = test_clock().now();
        let missing = SlotId::new();

        assert_eq!(
            ledger.try_hold(missing, ReservationId::new(), Duration::minutes(1), now).await.unwrap(),
            HoldOutcome::NotFound
        );
        assert_eq!(
            ledger.release(missing, ReservationId::new(), 1, now).await.unwrap(),
            ReleaseOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn duplicate_slots_are_rejected() {
        let (ledger, slot_id) = ledger_with_slot().await;
        let existing = ledger.get(slot_id).await.unwrap().unwrap();
        assert_eq!(ledger.create_slot(existing).await, Err(LedgerError::Duplicate(slot_id)));
    }

    #[tokio::test]
    async fn reclaim_respects_limit_and_deadline() {
        let now = test_clock().now();
        let ledger = InMemorySlotLedger::new();
        for _ in 0..3 {
            let time = TimeRange::new(now + Duration::hours(2), now + Duration::hours(3)).unwrap();
            let slot = Slot::new(SlotId::new(), FieldId::new(), time, now);
            let id = slot.id;
            ledger.create_slot(slot).await.unwrap();
            ledger.try_hold(id, ReservationId::new(), Duration::minutes(5), now).await.unwrap();
        }

        assert!(ledger.reclaim_expired(now + Duration::minutes(4), 10).await.unwrap().is_empty());

        let first = ledger.reclaim_expired(now + Duration::minutes(5), 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let rest = ledger.reclaim_expired(now + Duration::minutes(5), 2).await.unwrap();
        assert_eq!(rest.len(), 1);

        let slot = ledger.get(rest[0].slot_id).await.unwrap().unwrap();
        assert_eq!(slot.status, SlotStatus::Free);
        assert_eq!(slot.version, 2);
    }
}
