use super::SettlementAdapter;
use crate::error::BookingError;
use crate::events::PaymentRequested;
use async_trait::async_trait;
use fieldbook_core::error::HandlerError;
use fieldbook_core::event::EventEnvelope;
use fieldbook_runtime::EventHandler;

/// Handles `fieldbook.payment-requests` for the payment service.
pub struct PaymentRequestHandler {
    adapter: SettlementAdapter,
}

impl PaymentRequestHandler {
    /// Create a handler.
    #[must_use]
    pub const fn new(adapter: SettlementAdapter) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl EventHandler for PaymentRequestHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        if envelope.event_type != PaymentRequested::EVENT_TYPE {
            return Err(BookingError::Invalid(format!("unexpected event type {}", envelope.event_type)).into());
        }
        let request: PaymentRequested = envelope.open()?;
        self.adapter.request_payment(&request).await?;
        Ok(())
    }
}
