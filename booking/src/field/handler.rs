use super::HoldExpirySweep;
use crate::error::BookingError;
use crate::events::{SlotConfirmed, SlotHeld, SlotHoldFailed, SlotHoldRequested, SlotReleaseRequested};
use crate::ledger::{ConfirmOutcome, HoldOutcome, ReleaseOutcome, SlotLedger};
use crate::publisher::{Outgoing, Publisher};
use async_trait::async_trait;
use chrono::Duration;
use fieldbook_core::environment::Clock;
use fieldbook_core::error::HandlerError;
use fieldbook_core::event::{EventEnvelope, EventId};
use fieldbook_runtime::EventHandler;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Handles `fieldbook.slot-commands` for the field service.
///
/// Replaying a command gives the same ledger answer and the same derived
/// event id, so downstream consumers collapse the repeat.
pub struct SlotCommandHandler {
    ledger: Arc<dyn SlotLedger>,
    publisher: Publisher,
    clock: Arc<dyn Clock>,
}

impl SlotCommandHandler {
    /// Create a handler.
    #[must_use]
    pub fn new(ledger: Arc<dyn SlotLedger>, publisher: Publisher, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger,
            publisher,
            clock,
        }
    }

    async fn hold(&self, envelope: &EventEnvelope, request: SlotHoldRequested) -> Result<(), BookingError> {
        let now = self.clock.now();
        let out_of_range = || BookingError::Invalid(format!("hold ttl of {}s is out of range", request.ttl_secs));
        let ttl = i64::try_from(request.ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(out_of_range)?;
        let deadline = request.requested_at.checked_add_signed(ttl).ok_or_else(out_of_range)?;

        let outcome = if deadline <= now {
            None
        } else {
            Some(
                self.ledger
                    .try_hold(request.slot_id, request.order_id, ttl, now)
                    .await?,
            )
        };
        metrics::counter!(
            "ledger_holds_total",
            "outcome" => outcome.as_ref().map_or("expired", HoldOutcome::label)
        )
        .increment(1);

        let mut outgoing = Vec::with_capacity(2);
        match outcome {
            Some(HoldOutcome::Held {
                version,
                expires_at,
                displaced,
            }) => {
                if let Some(lapsed) = displaced {
                    // The previous holder must hear about it before the slot moves on.
                    info!(
                        slot_id = %lapsed.slot_id,
                        reservation_id = %lapsed.holder,
                        version = lapsed.hold_version,
                        "Lapsed hold taken over"
                    );
                    outgoing.push(HoldExpirySweep::announcement(&lapsed, now, Some(envelope.event_id))?);
                }
                info!(slot_id = %request.slot_id, reservation_id = %request.reservation_id, version, "Slot held");
                let event = SlotHeld {
                    reservation_id: request.reservation_id,
                    slot_id: request.slot_id,
                    version,
                    expires_at,
                };
                outgoing.push(Outgoing::seal(
                    derived(envelope, SlotHeld::EVENT_TYPE),
                    &event,
                    now,
                    Some(envelope.event_id),
                )?);
            }
            refused => {
                let reason = match refused {
                    None => "request expired",
                    Some(HoldOutcome::NotFound) => "slot not found",
                    _ => "slot unavailable",
                };
                warn!(slot_id = %request.slot_id, reservation_id = %request.reservation_id, reason, "Slot hold refused");
                let event = SlotHoldFailed {
                    reservation_id: request.reservation_id,
                    slot_id: request.slot_id,
                    reason: reason.to_string(),
                };
                outgoing.push(Outgoing::seal(
                    derived(envelope, SlotHoldFailed::EVENT_TYPE),
                    &event,
                    now,
                    Some(envelope.event_id),
                )?);
            }
        }
        self.publisher.publish_all(&outgoing).await
    }

    async fn confirm(&self, command: SlotConfirmed) -> Result<(), BookingError> {
        let outcome = self
            .ledger
            .confirm(command.slot_id, command.reservation_id, command.version, self.clock.now())
            .await?;
        match outcome {
            ConfirmOutcome::Booked => {
                info!(slot_id = %command.slot_id, reservation_id = %command.reservation_id, "Slot booked");
                Ok(())
            }
            ConfirmOutcome::Conflict => {
                // Paid for, but the hold is gone. Reconciliation reports it.
                error!(
                    slot_id = %command.slot_id,
                    reservation_id = %command.reservation_id,
                    version = command.version,
                    "Confirmed reservation lost its slot"
                );
                Ok(())
            }
            ConfirmOutcome::NotFound => Err(BookingError::Invalid(format!("slot {} not found", command.slot_id))),
        }
    }

    async fn release(&self, command: SlotReleaseRequested) -> Result<(), BookingError> {
        let outcome = self
            .ledger
            .release(command.slot_id, command.reservation_id, command.version, self.clock.now())
            .await?;
        match outcome {
            ReleaseOutcome::Freed => {
                info!(slot_id = %command.slot_id, reservation_id = %command.reservation_id, "Slot released");
                Ok(())
            }
            ReleaseOutcome::AlreadyFree => {
                debug!(slot_id = %command.slot_id, "Slot already free");
                Ok(())
            }
            ReleaseOutcome::Conflict => {
                warn!(
                    slot_id = %command.slot_id,
                    reservation_id = %command.reservation_id,
                    version = command.version,
                    "Stale release ignored"
                );
                Ok(())
            }
            ReleaseOutcome::NotFound => Err(BookingError::Invalid(format!("slot {} not found", command.slot_id))),
        }
    }
}

fn derived(envelope: &EventEnvelope, event_type: &str) -> EventId {
    EventId::derive(envelope.event_id, event_type)
}

#[async_trait]
impl EventHandler for SlotCommandHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let result = match envelope.event_type.as_str() {
            SlotHoldRequested::EVENT_TYPE => self.hold(envelope, envelope.open()?).await,
            SlotConfirmed::EVENT_TYPE => self.confirm(envelope.open()?).await,
            SlotReleaseRequested::EVENT_TYPE => self.release(envelope.open()?).await,
            other => Err(BookingError::Invalid(format!("unexpected event type {other}"))),
        };
        result.map_err(HandlerError::from)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::events::{Routed, SlotHoldExpired, topics};
    use crate::ledger::{InMemorySlotLedger, ReclaimedHold, Slot, SlotStatus};
    use crate::types::{FieldId, ReservationId, SlotId, TimeRange};
    use fieldbook_runtime::RetryPolicy;
    use fieldbook_testing::{InMemoryEventBus, ManualClock, test_clock};

    struct Fixture {
        handler: SlotCommandHandler,
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
        let handler = SlotCommandHandler::new(
            Arc::new(ledger.clone()),
            Publisher::new(Arc::new(bus.clone()), RetryPolicy::none()),
            Arc::new(clock.clone()),
        );
        Fixture {
            handler,
            ledger,
            bus,
            clock,
            slot_id,
        }
    }

    fn seal<E: Routed>(event: &E) -> EventEnvelope {
        EventEnvelope::seal(EventId::new(), event.key(), event, test_clock().now(), None).unwrap()
    }

    fn hold_request(slot_id: SlotId, reservation_id: ReservationId) -> SlotHoldRequested {
        SlotHoldRequested {
            reservation_id,
            slot_id,
            order_id: reservation_id,
            ttl_secs: 600,
            requested_at: test_clock().now(),
        }
    }

    #[tokio::test]
    async fn hold_request_publishes_slot_held() {
        let f = fixture().await;
        let reservation = ReservationId::new();
        let envelope = seal(&hold_request(f.slot_id, reservation));

        f.handler.handle(&envelope).await.unwrap();

        let published = f.bus.published(topics::SLOT_EVENTS);
        assert_eq!(published.len(), 1);
        let held: SlotHeld = published[0].open().unwrap();
        assert_eq!(held.reservation_id, reservation);
        assert_eq!(held.version, 1);
        assert_eq!(published[0].event_id, EventId::derive(envelope.event_id, SlotHeld::EVENT_TYPE));
        assert_eq!(published[0].key, reservation.to_string());
    }

    #[tokio::test]
    async fn replayed_hold_request_repeats_the_same_event() {
        let f = fixture().await;
        let envelope = seal(&hold_request(f.slot_id, ReservationId::new()));

        f.handler.handle(&envelope).await.unwrap();
        f.handler.handle(&envelope).await.unwrap();

        let published = f.bus.published(topics::SLOT_EVENTS);
        assert_eq!(published.len(), 2);
        assert_eq!(published[0], published[1]);
    }

    #[tokio::test]
    async fn competing_hold_is_refused() {
        let f = fixture().await;
        f.handler.handle(&seal(&hold_request(f.slot_id, ReservationId::new()))).await.unwrap();
        f.handler.handle(&seal(&hold_request(f.slot_id, ReservationId::new()))).await.unwrap();

        let published = f.bus.published(topics::SLOT_EVENTS);
        let failed: SlotHoldFailed = published[1].open().unwrap();
        assert_eq!(failed.reason, "slot unavailable");
    }

    #[tokio::test]
    async fn taking_over_a_lapsed_hold_expires_the_previous_holder() {
        let f = fixture().await;
        let first = ReservationId::new();
        f.handler.handle(&seal(&hold_request(f.slot_id, first))).await.unwrap();

        f.clock.advance(Duration::minutes(11));
        let mut late = hold_request(f.slot_id, ReservationId::new());
        late.requested_at = f.clock.now();
        f.handler.handle(&seal(&late)).await.unwrap();

        let published = f.bus.published(topics::SLOT_EVENTS);
        assert_eq!(published.len(), 3);
        assert_eq!(published[1].event_type, SlotHoldExpired::EVENT_TYPE);
        let expired: SlotHoldExpired = published[1].open().unwrap();
        assert_eq!(expired.reservation_id, first);
        let lapsed = ReclaimedHold {
            slot_id: f.slot_id,
            holder: first,
            hold_version: 1,
        };
        // Same id the sweep would have used, so the two announcements collapse.
        assert_eq!(published[1].event_id, HoldExpirySweep::event_id(&lapsed));

        let held: SlotHeld = published[2].open().unwrap();
        assert_eq!(held.reservation_id, late.reservation_id);
        assert_eq!(held.version, 2);
    }

    #[tokio::test]
    async fn stale_hold_request_is_refused_without_touching_the_ledger() {
        let f = fixture().await;
        f.clock.advance(Duration::minutes(10));

        f.handler.handle(&seal(&hold_request(f.slot_id, ReservationId::new()))).await.unwrap();

        let failed: SlotHoldFailed = f.bus.published(topics::SLOT_EVENTS)[0].open().unwrap();
        assert_eq!(failed.reason, "request expired");
        assert_eq!(f.ledger.get(f.slot_id).await.unwrap().unwrap().status, SlotStatus::Free);
    }

    #[tokio::test]
    async fn confirm_and_release_apply_to_the_ledger() {
        let f = fixture().await;
        let winner = ReservationId::new();
        f.handler.handle(&seal(&hold_request(f.slot_id, winner))).await.unwrap();

        let stale = SlotReleaseRequested {
            slot_id: f.slot_id,
            reservation_id: ReservationId::new(),
            version: 1,
        };
        f.handler.handle(&seal(&stale)).await.unwrap();
        assert_eq!(f.ledger.get(f.slot_id).await.unwrap().unwrap().status, SlotStatus::Held);

        let confirm = SlotConfirmed {
            slot_id: f.slot_id,
            reservation_id: winner,
            version: 1,
        };
        f.handler.handle(&seal(&confirm)).await.unwrap();
        f.handler.handle(&seal(&confirm)).await.unwrap();
        assert_eq!(f.ledger.get(f.slot_id).await.unwrap().unwrap().status, SlotStatus::Booked);
    }

    #[tokio::test]
    async fn unknown_event_types_are_invalid() {
        let f = fixture().await;
        let mut envelope = seal(&hold_request(f.slot_id, ReservationId::new()));
        envelope.event_type = "Mystery.v1".to_string();

        let error = f.handler.handle(&envelope).await.unwrap_err();
        assert_eq!(error.kind(), "invalid");
    }
}
