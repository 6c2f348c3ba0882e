//! Deadline and reconciliation sweeps of the order service.

use super::{Reservation, ReservationAction, ReservationReducer, ReservationService, ReservationStatus};
use crate::error::BookingError;
use crate::events::SlotReleaseRequested;
use crate::ledger::{SlotStatus, SlotStatusView};
use crate::types::ReservationId;
use crate::publisher::Outgoing;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fieldbook_core::error::HandlerError;
use fieldbook_core::event::EventId;
use fieldbook_runtime::Sweep;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info, warn};

/// Fails reservations whose payment outcome did not arrive in time.
pub struct PaymentTimeoutSweep {
    service: ReservationService,
    batch_size: usize,
}

impl PaymentTimeoutSweep {
    /// Create the sweep, timing out at most `batch_size` reservations per pass.
    #[must_use]
    pub const fn new(service: ReservationService, batch_size: usize) -> Self {
        Self { service, batch_size }
    }
}

#[async_trait]
impl Sweep for PaymentTimeoutSweep {
    fn name(&self) -> &'static str {
        "payment_timeout"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<usize, HandlerError> {
        let overdue = self
            .service
            .repository()
            .payment_overdue(now, self.batch_size)
            .await
            .map_err(BookingError::from)?;

        let mut resolved = 0;
        for reservation in overdue {
            let action = ReservationAction::PaymentTimedOut {
                event_id: ReservationAction::timeout_event_id(&reservation),
            };
            match self.service.apply(reservation.id, action).await {
                Ok(after) if after.status == ReservationStatus::PaymentFailed => {
                    info!(reservation_id = %reservation.id, "Payment timed out");
                    resolved += 1;
                }
                Ok(_) => {}
                // A payment outcome raced the sweep; the next pass sees the new status.
                Err(e) => warn!(reservation_id = %reservation.id, error = %e, "Payment timeout not applied"),
            }
        }
        Ok(resolved)
    }
}

/// Compares reservations with the slot ledger and repairs what a lost
/// message left inconsistent.
///
/// - A confirmed reservation whose slot is still held by it at the hold
///   version: `SlotConfirmed` was lost, it is published again.
/// - A confirmed reservation whose slot is not held or booked by it: the
///   hold lapsed before confirmation reached the ledger. Logged for manual
///   follow-up; nothing is published.
/// - A failed, expired or rejected reservation whose slot is still held by
///   it: the slot is released.
/// - A reservation stuck in `PENDING_HOLD` past the grace period: the hold
///   request is published again.
///
/// Terminal reservations are paged through by `(updated_at, id)` from a
/// cursor that starts `grace` in the past. A reservation that needed repair
/// is checked again one `grace` later, until the ledger agrees with it.
pub struct ReconciliationSweep {
    service: ReservationService,
    slots: Arc<dyn SlotStatusView>,
    grace: Duration,
    batch_size: usize,
    cursor: Mutex<Option<(DateTime<Utc>, ReservationId)>>,
    repaired_at: Mutex<HashMap<ReservationId, DateTime<Utc>>>,
}

impl ReconciliationSweep {
    /// Create the sweep.
    ///
    /// `grace` is how long a reservation is left alone after its last change
    /// before it is compared with the ledger.
    #[must_use]
    pub fn new(service: ReservationService, slots: Arc<dyn SlotStatusView>, grace: Duration, batch_size: usize) -> Self {
        Self {
            service,
            slots,
            grace,
            batch_size,
            cursor: Mutex::new(None),
            repaired_at: Mutex::new(HashMap::new()),
        }
    }

    /// Reservations repaired earlier and waiting to be checked again.
    #[must_use]
    pub fn awaiting_recheck(&self) -> usize {
        self.repaired_at.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn recheck_repaired(&self, now: DateTime<Utc>) -> Result<usize, BookingError> {
        let due: Vec<ReservationId> = self
            .repaired_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, at)| now - **at >= self.grace)
            .map(|(id, _)| *id)
            .collect();

        let mut repaired = 0;
        for id in due {
            let still_broken = match self.service.get(id).await? {
                Some(reservation) => self.reconcile(&reservation, now).await?,
                None => false,
            };
            let mut repaired_at = self.repaired_at.lock().unwrap_or_else(PoisonError::into_inner);
            if still_broken {
                repaired_at.insert(id, now);
                repaired += 1;
            } else {
                repaired_at.remove(&id);
            }
        }
        Ok(repaired)
    }

    async fn reconcile(&self, reservation: &Reservation, now: DateTime<Utc>) -> Result<bool, BookingError> {
        let Some(slot) = self
            .slots
            .slot(reservation.slot_id)
            .await
            .map_err(BookingError::from)?
        else {
            warn!(reservation_id = %reservation.id, slot_id = %reservation.slot_id, "Reservation for unknown slot");
            return Ok(false);
        };
        let held_by_us = slot.status == SlotStatus::Held && slot.holder == Some(reservation.id);

        let outgoing = match reservation.status {
            ReservationStatus::Confirmed => {
                let booked_by_us = slot.status == SlotStatus::Booked && slot.holder == Some(reservation.id);
                if booked_by_us {
                    return Ok(false);
                }
                if !held_by_us || Some(slot.version) != reservation.hold_version {
                    error!(
                        reservation_id = %reservation.id,
                        slot_id = %slot.id,
                        slot_status = %slot.status,
                        "Confirmed reservation lost its slot"
                    );
                    return Ok(false);
                }
                ReservationReducer::implied_effects(reservation, self.service.environment())
                    .iter()
                    .map(|effect| effect.seal(now, reservation.last_event_id))
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .flatten()
                    .collect()
            }
            _ if held_by_us => {
                let event = SlotReleaseRequested {
                    slot_id: slot.id,
                    reservation_id: reservation.id,
                    version: slot.version,
                };
                let event_id = EventId::derive(reservation.id.as_cause(), &format!("reconcile-release:{}", slot.version));
                vec![Outgoing::seal(event_id, &event, now, reservation.last_event_id)?]
            }
            _ => return Ok(false),
        };

        warn!(
            reservation_id = %reservation.id,
            slot_id = %slot.id,
            status = %reservation.status,
            events = outgoing.len(),
            "Reconciling reservation with the slot ledger"
        );
        self.service.publisher().publish_all(&outgoing).await?;
        Ok(true)
    }

    async fn republish_stuck_holds(&self, before: DateTime<Utc>) -> Result<usize, BookingError> {
        let stuck = self
            .service
            .repository()
            .pending_hold_before(before, self.batch_size)
            .await?;
        let now = self.service.environment().clock.now();
        for reservation in &stuck {
            let outgoing = ReservationReducer::implied_effects(reservation, self.service.environment())
                .iter()
                .map(|effect| effect.seal(now, None))
                .collect::<Result<Vec<_>, _>>()?;
            warn!(reservation_id = %reservation.id, "Hold request unanswered, publishing again");
            self.service
                .publisher()
                .publish_all(&outgoing.into_iter().flatten().collect::<Vec<_>>())
                .await?;
        }
        Ok(stuck.len())
    }
}

#[async_trait]
impl Sweep for ReconciliationSweep {
    fn name(&self) -> &'static str {
        "reconciliation"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<usize, HandlerError> {
        let settled_before = now - self.grace;
        let mut repaired = self.recheck_repaired(now).await?;

        let after = {
            let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
            *cursor.get_or_insert((settled_before - self.grace, ReservationId::from_uuid(uuid::Uuid::nil())))
        };
        let candidates = self
            .service
            .repository()
            .list_terminal_after(after, self.batch_size)
            .await
            .map_err(BookingError::from)?;

        for reservation in candidates.iter().take_while(|r| r.updated_at <= settled_before) {
            if self.reconcile(reservation, now).await? {
                self.repaired_at
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(reservation.id, now);
                repaired += 1;
            }
            *self.cursor.lock().unwrap_or_else(PoisonError::into_inner) = Some((reservation.updated_at, reservation.id));
        }

        repaired += self.republish_stuck_holds(settled_before).await?;
        Ok(repaired)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::events::{Routed, SlotConfirmed, SlotHoldRequested, topics};
    use crate::ledger::{InMemorySlotLedger, Slot, SlotLedger};
    use crate::publisher::Publisher;
    use crate::reservation::{BookingRequest, InMemoryReservationRepository, ReservationEnvironment};
    use crate::types::{FieldId, Money, SlotId, TimeRange, UserId};
    use fieldbook_core::environment::Clock;
    use fieldbook_runtime::RetryPolicy;
    use fieldbook_testing::{InMemoryEventBus, ManualClock, test_clock};

    struct Fixture {
        service: ReservationService,
        ledger: InMemorySlotLedger,
        bus: InMemoryEventBus,
        clock: ManualClock,
        slot_id: SlotId,
    }

    async fn fixture() -> Fixture {
        let clock = ManualClock::starting_at(test_clock().now());
        let now = clock.now();
        let ledger = InMemorySlotLedger::new();
        let slot = Slot::new(
            SlotId::new(),
            FieldId::new(),
            TimeRange::new(now + Duration::days(1), now + Duration::days(1) + Duration::hours(1)).unwrap(),
            now,
        );
        let slot_id = slot.id;
        ledger.create_slot(slot).await.unwrap();

        let bus = InMemoryEventBus::new();
        let service = ReservationService::new(
            Arc::new(InMemoryReservationRepository::new()),
            Publisher::new(Arc::new(bus.clone()), RetryPolicy::none()),
            ReservationEnvironment {
                clock: Arc::new(clock.clone()),
                hold_ttl: Duration::minutes(15),
                payment_timeout: Duration::minutes(10),
            },
            Money::new(4500, "EUR"),
        );
        Fixture {
            service,
            ledger,
            bus,
            clock,
            slot_id,
        }
    }

    async fn pending_payment(f: &Fixture) -> Reservation {
        let r = f
            .service
            .book(BookingRequest {
                slot_id: f.slot_id,
                user_id: UserId::new(),
                idempotency_key: "k1".into(),
            })
            .await
            .unwrap();
        let held = f
            .ledger
            .try_hold(f.slot_id, r.id, Duration::minutes(15), f.clock.now())
            .await
            .unwrap();
        let crate::ledger::HoldOutcome::Held { version, expires_at, .. } = held else {
            panic!("slot should be free");
        };
        f.service
            .apply(
                r.id,
                ReservationAction::SlotHeld {
                    event_id: EventId::new(),
                    version,
                    expires_at,
                },
            )
            .await
            .unwrap()
    }

    fn reconciliation(f: &Fixture) -> ReconciliationSweep {
        ReconciliationSweep::new(f.service.clone(), Arc::new(f.ledger.clone()), Duration::minutes(1), 100)
    }

    fn published_of<E: Routed + serde::de::DeserializeOwned + fieldbook_core::event::Event>(
        bus: &InMemoryEventBus,
        event_type: &str,
    ) -> Vec<E> {
        bus.published(E::TOPIC)
            .iter()
            .filter(|e| e.event_type == event_type)
            .map(|e| e.open().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn overdue_payment_fails_the_reservation_and_releases_the_slot() {
        let f = fixture().await;
        let r = pending_payment(&f).await;
        let sweep = PaymentTimeoutSweep::new(f.service.clone(), 10);

        assert_eq!(sweep.run(f.clock.now() + Duration::minutes(9)).await.unwrap(), 0);
        assert_eq!(sweep.run(f.clock.now() + Duration::minutes(10)).await.unwrap(), 1);
        assert_eq!(sweep.run(f.clock.now() + Duration::minutes(11)).await.unwrap(), 0);

        let stored = f.service.get(r.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::PaymentFailed);
        assert_eq!(stored.failure_reason.as_deref(), Some("payment timed out"));
        let releases: Vec<SlotReleaseRequested> = published_of(&f.bus, SlotReleaseRequested::EVENT_TYPE);
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].version, r.hold_version.unwrap());
    }

    #[tokio::test]
    async fn lost_confirmation_is_published_again() {
        let f = fixture().await;
        let r = pending_payment(&f).await;
        f.service
            .apply(
                r.id,
                ReservationAction::PaymentSucceeded {
                    event_id: EventId::new(),
                    payment_id: crate::types::PaymentIntentId::new(),
                    gateway_ref: "ch_1".into(),
                },
            )
            .await
            .unwrap();
        // The ledger never saw SlotConfirmed.
        let sweep = reconciliation(&f);

        assert_eq!(sweep.run(f.clock.now()).await.unwrap(), 0);
        f.clock.advance(Duration::minutes(2));
        assert_eq!(sweep.run(f.clock.now()).await.unwrap(), 1);
        assert_eq!(sweep.run(f.clock.now()).await.unwrap(), 0);

        let confirms: Vec<SlotConfirmed> = published_of(&f.bus, SlotConfirmed::EVENT_TYPE);
        assert_eq!(confirms.len(), 2);
        assert_eq!(confirms[0], confirms[1]);
    }

    #[tokio::test]
    async fn repaired_reservation_is_checked_again_until_the_ledger_agrees() {
        let f = fixture().await;
        let r = pending_payment(&f).await;
        f.service
            .apply(
                r.id,
                ReservationAction::PaymentSucceeded {
                    event_id: EventId::new(),
                    payment_id: crate::types::PaymentIntentId::new(),
                    gateway_ref: "ch_1".into(),
                },
            )
            .await
            .unwrap();
        let sweep = reconciliation(&f);
        f.clock.advance(Duration::minutes(2));
        assert_eq!(sweep.run(f.clock.now()).await.unwrap(), 1);
        assert_eq!(sweep.awaiting_recheck(), 1);

        // The republished confirmation was lost as well.
        f.clock.advance(Duration::minutes(2));
        assert_eq!(sweep.run(f.clock.now()).await.unwrap(), 1);
        assert_eq!(published_of::<SlotConfirmed>(&f.bus, SlotConfirmed::EVENT_TYPE).len(), 3);

        f.ledger
            .confirm(f.slot_id, r.id, r.hold_version.unwrap(), f.clock.now())
            .await
            .unwrap();
        f.clock.advance(Duration::minutes(2));
        assert_eq!(sweep.run(f.clock.now()).await.unwrap(), 0);
        assert_eq!(sweep.awaiting_recheck(), 0);
    }

    #[tokio::test]
    async fn failed_reservation_still_holding_its_slot_releases_it() {
        let f = fixture().await;
        let r = pending_payment(&f).await;
        f.service
            .apply(
                r.id,
                ReservationAction::PaymentFailed {
                    event_id: EventId::new(),
                    payment_id: None,
                    reason: "card declined".into(),
                },
            )
            .await
            .unwrap();
        let sweep = reconciliation(&f);
        f.clock.advance(Duration::minutes(2));

        assert_eq!(sweep.run(f.clock.now()).await.unwrap(), 1);
        let releases: Vec<SlotReleaseRequested> = published_of(&f.bus, SlotReleaseRequested::EVENT_TYPE);
        assert_eq!(releases.len(), 2);
        assert_eq!(releases[1].reservation_id, r.id);
    }

    #[tokio::test]
    async fn unanswered_hold_request_is_published_again() {
        let f = fixture().await;
        f.service
            .book(BookingRequest {
                slot_id: f.slot_id,
                user_id: UserId::new(),
                idempotency_key: "k1".into(),
            })
            .await
            .unwrap();
        let sweep = reconciliation(&f);

        assert_eq!(sweep.run(f.clock.now()).await.unwrap(), 0);
        f.clock.advance(Duration::minutes(2));
        assert_eq!(sweep.run(f.clock.now()).await.unwrap(), 1);

        let requests: Vec<SlotHoldRequested> = published_of(&f.bus, SlotHoldRequested::EVENT_TYPE);
        assert_eq!(requests.len(), 2);
        assert_eq!(f.bus.published(topics::SLOT_COMMANDS)[0].event_id, f.bus.published(topics::SLOT_COMMANDS)[1].event_id);
    }
}
