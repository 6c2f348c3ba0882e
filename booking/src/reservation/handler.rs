use super::{ReservationAction, ReservationService, ReservationStatus};
use crate::error::BookingError;
use crate::events::{PaymentFailed, PaymentSucceeded, SlotHeld, SlotHoldExpired, SlotHoldFailed};
use crate::types::ReservationId;
use async_trait::async_trait;
use fieldbook_core::error::HandlerError;
use fieldbook_core::event::EventEnvelope;
use fieldbook_runtime::EventHandler;
use tracing::warn;

/// Handles `fieldbook.slot-events` and `fieldbook.payment-outcomes` for the
/// order service.
pub struct OrderEventHandler {
    service: ReservationService,
}

impl OrderEventHandler {
    /// Create a handler driving `service`.
    #[must_use]
    pub const fn new(service: ReservationService) -> Self {
        Self { service }
    }

    fn action(envelope: &EventEnvelope) -> Result<(ReservationId, ReservationAction), BookingError> {
        let event_id = envelope.event_id;
        Ok(match envelope.event_type.as_str() {
            SlotHeld::EVENT_TYPE => {
                let e: SlotHeld = envelope.open()?;
                (
                    e.reservation_id,
                    ReservationAction::SlotHeld {
                        event_id,
                        version: e.version,
                        expires_at: e.expires_at,
                    },
                )
            }
            SlotHoldFailed::EVENT_TYPE => {
                let e: SlotHoldFailed = envelope.open()?;
                (e.reservation_id, ReservationAction::SlotHoldFailed { event_id, reason: e.reason })
            }
            SlotHoldExpired::EVENT_TYPE => {
                let e: SlotHoldExpired = envelope.open()?;
                (e.reservation_id, ReservationAction::SlotHoldExpired { event_id })
            }
            PaymentSucceeded::EVENT_TYPE => {
                let e: PaymentSucceeded = envelope.open()?;
                (
                    e.reservation_id,
                    ReservationAction::PaymentSucceeded {
                        event_id,
                        payment_id: e.payment_id,
                        gateway_ref: e.gateway_ref,
                    },
                )
            }
            PaymentFailed::EVENT_TYPE => {
                let e: PaymentFailed = envelope.open()?;
                (
                    e.reservation_id,
                    ReservationAction::PaymentFailed {
                        event_id,
                        payment_id: e.payment_id,
                        reason: e.reason,
                    },
                )
            }
            other => return Err(BookingError::Invalid(format!("unexpected event type {other}"))),
        })
    }
}

#[async_trait]
impl EventHandler for OrderEventHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let (reservation_id, action) = Self::action(envelope)?;
        let paid = matches!(action, ReservationAction::PaymentSucceeded { .. });

        let reservation = self.service.apply(reservation_id, action).await?;

        if paid && reservation.status != ReservationStatus::Confirmed {
            // Refunds are handled outside this system.
            warn!(
                reservation_id = %reservation_id,
                status = %reservation.status,
                event_id = %envelope.event_id,
                "Payment collected for a reservation that cannot be confirmed, refund needed"
            );
        }
        Ok(())
    }
}
