use super::{
    CallbackVerifier, ChargeRequest, GatewayError, PaymentGateway, PaymentIntent, PaymentIntentRepository,
    PaymentStatus, Settlement, SignatureError,
};
use crate::error::{BookingError, RepositoryError};
use crate::events::{PaymentFailed, PaymentRequested, PaymentSucceeded};
use crate::publisher::{Outgoing, Publisher};
use chrono::Duration;
use fieldbook_core::environment::Clock;
use fieldbook_core::event::EventId;
use fieldbook_runtime::RetryPolicy;
use fieldbook_runtime::retry::retry_with_predicate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Body of a gateway callback.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCallback {
    /// Charge reference from the receipt
    pub gateway_ref: String,
    /// `succeeded` or `failed`
    pub status: CallbackStatus,
    /// Failure reason, for failed charges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Settlement reported by a callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    /// Money collected
    Succeeded,
    /// Charge failed
    Failed,
}

/// What a verified callback did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The intent was settled by this callback.
    Settled,
    /// The intent was already final; its outcome was announced again.
    Duplicate,
    /// No intent has this gateway reference.
    NotFound,
}

impl CallbackOutcome {
    const fn label(self) -> &'static str {
        match self {
            Self::Settled => "settled",
            Self::Duplicate => "duplicate",
            Self::NotFound => "not_found",
        }
    }
}

/// Why a callback was not processed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WebhookError {
    /// The signature did not verify.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// The body is not a callback.
    #[error("invalid callback payload: {0}")]
    Payload(String),

    /// The callback could not be recorded; the gateway should retry.
    #[error(transparent)]
    Unavailable(#[from] BookingError),
}

/// Talks to the gateway and announces settlement outcomes.
///
/// Outcome events carry ids derived from the intent id, so announcing an
/// outcome twice produces the same event.
#[derive(Clone)]
pub struct SettlementAdapter {
    repository: Arc<dyn PaymentIntentRepository>,
    gateway: Arc<dyn PaymentGateway>,
    publisher: Publisher,
    verifier: CallbackVerifier,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    settlement_timeout: Duration,
}

impl SettlementAdapter {
    /// Create the adapter.
    #[must_use]
    pub fn new(
        repository: Arc<dyn PaymentIntentRepository>,
        gateway: Arc<dyn PaymentGateway>,
        publisher: Publisher,
        verifier: CallbackVerifier,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        settlement_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            gateway,
            publisher,
            verifier,
            clock,
            retry,
            settlement_timeout,
        }
    }

    /// Create or resume the payment intent of a request and charge it.
    ///
    /// A repeated request finds the intent by idempotency key. A charge the
    /// gateway already accepted is not sent again, and a final intent has
    /// its outcome announced again.
    ///
    /// # Errors
    ///
    /// [`BookingError::Transient`] if the gateway, storage or bus stays
    /// unavailable through the retries.
    pub async fn request_payment(&self, request: &PaymentRequested) -> Result<PaymentIntent, BookingError> {
        let now = self.clock.now();
        let intent = self
            .repository
            .create_or_get(PaymentIntent::new(
                request.reservation_id,
                request.amount.clone(),
                request.idempotency_key.clone(),
                now + self.settlement_timeout,
                now,
            ))
            .await?;

        match intent.status {
            PaymentStatus::Created => self.charge(intent).await,
            PaymentStatus::Settling => {
                debug!(payment_id = %intent.id, "Charge already accepted, waiting for callback");
                Ok(intent)
            }
            PaymentStatus::Succeeded | PaymentStatus::Failed | PaymentStatus::Expired => {
                self.announce(&intent).await?;
                Ok(intent)
            }
        }
    }

    async fn charge(&self, intent: PaymentIntent) -> Result<PaymentIntent, BookingError> {
        let request = ChargeRequest {
            idempotency_key: intent.idempotency_key.clone(),
            amount: intent.amount.clone(),
            reference: intent.reservation_id.to_string(),
        };
        let charged = retry_with_predicate(
            &self.retry,
            || self.gateway.create_charge(&request),
            GatewayError::is_transient,
        )
        .await;

        let now = self.clock.now();
        let next = match charged {
            Ok(receipt) => intent.settling(receipt.gateway_ref, now),
            Err(GatewayError::Declined(reason)) => intent.decline(reason, now),
            Err(e @ GatewayError::Transient(_)) => {
                warn!(payment_id = %intent.id, error = %e, "Gateway unavailable");
                return Err(BookingError::Transient(e.to_string()));
            }
        };
        let Some(next) = next else {
            return Ok(intent);
        };

        if !self.repository.transition(&next, PaymentStatus::Created).await? {
            let current = self.reload(&intent).await?;
            if let Some(gateway_ref) = next.gateway_ref.as_deref().filter(|_| current.gateway_ref.is_none()) {
                // The intent expired while the gateway accepted the charge.
                error!(
                    payment_id = %intent.id,
                    reservation_id = %intent.reservation_id,
                    status = %current.status,
                    gateway_ref,
                    "Charge accepted for a closed intent, refund needed"
                );
            }
            return Ok(current);
        }
        info!(
            payment_id = %next.id,
            reservation_id = %next.reservation_id,
            status = %next.status,
            gateway_ref = next.gateway_ref.as_deref().unwrap_or_default(),
            "Charge submitted"
        );
        if next.status.is_terminal() {
            self.announce(&next).await?;
        }
        Ok(next)
    }

    async fn reload(&self, intent: &PaymentIntent) -> Result<PaymentIntent, BookingError> {
        self.repository
            .get(intent.id)
            .await?
            .ok_or_else(|| BookingError::NotFound(format!("payment intent {}", intent.id)))
    }

    /// Verify and apply a gateway callback.
    ///
    /// # Errors
    ///
    /// - [`WebhookError::Signature`] if the signature does not verify
    /// - [`WebhookError::Payload`] if the body is not a callback
    /// - [`WebhookError::Unavailable`] if the outcome could not be stored or
    ///   announced; the gateway retries and the retry is answered as a duplicate
    pub async fn handle_webhook(&self, signature: &str, body: &[u8]) -> Result<CallbackOutcome, WebhookError> {
        let now = self.clock.now();
        if let Err(e) = self.verifier.verify(signature, body, now) {
            metrics::counter!("payment_callbacks_total", "outcome" => "rejected").increment(1);
            warn!(error = %e, "Callback signature rejected");
            return Err(e.into());
        }
        let callback: GatewayCallback =
            serde_json::from_slice(body).map_err(|e| WebhookError::Payload(e.to_string()))?;

        let outcome = self.handle_callback(&callback).await?;
        metrics::counter!("payment_callbacks_total", "outcome" => outcome.label()).increment(1);
        Ok(outcome)
    }

    /// Apply a verified callback. Only the first callback for an intent
    /// changes it.
    ///
    /// # Errors
    ///
    /// [`BookingError::Transient`] if storage or the bus is unavailable.
    pub async fn handle_callback(&self, callback: &GatewayCallback) -> Result<CallbackOutcome, BookingError> {
        let Some(intent) = self.repository.get_by_gateway_ref(&callback.gateway_ref).await? else {
            warn!(gateway_ref = %callback.gateway_ref, "Callback for unknown charge");
            return Ok(CallbackOutcome::NotFound);
        };

        let settlement = match callback.status {
            CallbackStatus::Succeeded => Settlement::Succeeded,
            CallbackStatus::Failed => Settlement::Failed {
                reason: callback
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "payment failed".to_string()),
            },
        };

        let Some(next) = intent.settle(settlement, self.clock.now()) else {
            return self.duplicate(&intent).await;
        };
        match self.repository.transition(&next, PaymentStatus::Settling).await {
            Ok(true) => {}
            Ok(false) => return self.duplicate(&self.reload(&intent).await?).await,
            Err(RepositoryError::Duplicate(reason)) => {
                // Another intent of the reservation already succeeded.
                warn!(payment_id = %intent.id, reason = %reason, "Second successful charge for one reservation, refund needed");
                return Ok(CallbackOutcome::Duplicate);
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            payment_id = %next.id,
            reservation_id = %next.reservation_id,
            status = %next.status,
            "Payment settled"
        );
        self.announce(&next).await?;
        Ok(CallbackOutcome::Settled)
    }

    async fn duplicate(&self, intent: &PaymentIntent) -> Result<CallbackOutcome, BookingError> {
        debug!(payment_id = %intent.id, status = %intent.status, "Duplicate callback");
        if intent.status.is_terminal() {
            self.announce(intent).await?;
        }
        Ok(CallbackOutcome::Duplicate)
    }

    /// Publish the outcome of a final intent.
    ///
    /// # Errors
    ///
    /// [`BookingError::Transient`] if the bus is unavailable.
    pub async fn announce(&self, intent: &PaymentIntent) -> Result<(), BookingError> {
        let cause = EventId::from_uuid(*intent.id.as_uuid());
        let now = self.clock.now();
        let outgoing = match intent.status {
            PaymentStatus::Succeeded => Outgoing::seal(
                EventId::derive(cause, PaymentSucceeded::EVENT_TYPE),
                &PaymentSucceeded {
                    reservation_id: intent.reservation_id,
                    payment_id: intent.id,
                    gateway_ref: intent.gateway_ref.clone().unwrap_or_default(),
                },
                now,
                None,
            )?,
            PaymentStatus::Failed | PaymentStatus::Expired => Outgoing::seal(
                EventId::derive(cause, PaymentFailed::EVENT_TYPE),
                &PaymentFailed {
                    reservation_id: intent.reservation_id,
                    payment_id: Some(intent.id),
                    reason: intent
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| intent.status.as_str().to_lowercase()),
                },
                now,
                None,
            )?,
            PaymentStatus::Created | PaymentStatus::Settling => return Ok(()),
        };
        self.publisher.publish(&outgoing).await
    }

    /// Repository shared with the expiry sweep.
    #[must_use]
    pub fn repository(&self) -> Arc<dyn PaymentIntentRepository> {
        Arc::clone(&self.repository)
    }

    /// Signs callbacks for the development gateway.
    #[must_use]
    pub const fn verifier(&self) -> &CallbackVerifier {
        &self.verifier
    }
}
