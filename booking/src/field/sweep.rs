use crate::error::BookingError;
use crate::events::SlotHoldExpired;
use crate::ledger::{ReclaimedHold, SlotLedger};
use crate::publisher::{Outgoing, Publisher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldbook_core::error::HandlerError;
use fieldbook_core::event::EventId;
use fieldbook_runtime::Sweep;
use std::sync::{Arc, Mutex, PoisonError};

/// Frees slots whose hold lapsed and tells the order service.
///
/// The ledger write and the publish are not atomic. Holds whose
/// announcement failed are kept and announced again on the next pass. If
/// the process dies in between, the reservation still ends through its
/// payment deadline, which never outlives the hold.
pub struct HoldExpirySweep {
    ledger: Arc<dyn SlotLedger>,
    publisher: Publisher,
    batch_size: usize,
    unannounced: Mutex<Vec<ReclaimedHold>>,
}

impl HoldExpirySweep {
    /// Create the sweep, reclaiming at most `batch_size` holds per pass.
    #[must_use]
    pub fn new(ledger: Arc<dyn SlotLedger>, publisher: Publisher, batch_size: usize) -> Self {
        Self {
            ledger,
            publisher,
            batch_size,
            unannounced: Mutex::new(Vec::new()),
        }
    }

    /// Id of the expiry event of one hold.
    #[must_use]
    pub fn event_id(hold: &ReclaimedHold) -> EventId {
        EventId::derive(
            EventId::from_uuid(*hold.slot_id.as_uuid()),
            &format!("{}:{}", SlotHoldExpired::EVENT_TYPE, hold.hold_version),
        )
    }

    /// The `SlotHoldExpired` event telling the holder its hold is gone.
    ///
    /// # Errors
    ///
    /// [`BookingError::Fatal`] if the event cannot be encoded.
    pub fn announcement(hold: &ReclaimedHold, now: DateTime<Utc>, cause: Option<EventId>) -> Result<Outgoing, BookingError> {
        let event = SlotHoldExpired {
            reservation_id: hold.holder,
            slot_id: hold.slot_id,
        };
        Outgoing::seal(Self::event_id(hold), &event, now, cause)
    }

    /// Holds reclaimed but not yet announced.
    #[must_use]
    pub fn unannounced(&self) -> usize {
        self.unannounced.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl Sweep for HoldExpirySweep {
    fn name(&self) -> &'static str {
        "hold_expiry"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<usize, HandlerError> {
        let reclaimed = self
            .ledger
            .reclaim_expired(now, self.batch_size)
            .await
            .map_err(|e| HandlerError::transient(e.to_string()))?;
        let resolved = reclaimed.len();

        for hold in &reclaimed {
            tracing::info!(
                slot_id = %hold.slot_id,
                reservation_id = %hold.holder,
                version = hold.hold_version,
                "Hold expired, slot reclaimed"
            );
        }

        let mut due = std::mem::take(&mut *self.unannounced.lock().unwrap_or_else(PoisonError::into_inner));
        due.extend(reclaimed);

        let mut failed = Vec::new();
        for hold in due {
            let outgoing = Self::announcement(&hold, now, None).map_err(|e| HandlerError::fatal(e.to_string()))?;
            if let Err(e) = self.publisher.publish(&outgoing).await {
                tracing::error!(slot_id = %hold.slot_id, error = %e, "Could not announce hold expiry, will retry");
                failed.push(hold);
            }
        }
        if !failed.is_empty() {
            self.unannounced
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(failed);
        }
        Ok(resolved)
    }
}
