//! Payment gateway clients.

use crate::types::Money;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Gateway errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The gateway could not be reached or asked us to come back later.
    #[error("gateway unavailable: {0}")]
    Transient(String),

    /// The gateway refused the charge.
    #[error("charge declined: {0}")]
    Declined(String),
}

impl GatewayError {
    /// Whether retrying the same charge can succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A charge to create.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRequest {
    /// Key the gateway collapses repeated attempts on
    pub idempotency_key: String,
    /// Amount to charge
    pub amount: Money,
    /// Our reference, shown on the gateway dashboard
    pub reference: String,
}

/// The gateway accepted a charge; its outcome arrives by callback.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeReceipt {
    /// Gateway's charge reference
    pub gateway_ref: String,
}

/// An external payment processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a charge. Repeating a request with the same idempotency key
    /// returns the receipt of the first one.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Transient`] if the request can be retried,
    /// [`GatewayError::Declined`] if the charge was refused.
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError>;
}

#[derive(Serialize)]
struct ChargeBody<'a> {
    amount_cents: i64,
    currency: &'a str,
    reference: &'a str,
}

#[derive(Deserialize)]
struct ChargeResponse {
    id: String,
}

/// [`PaymentGateway`] over a REST API.
///
/// `POST {base_url}/charges` with a bearer token and an `Idempotency-Key`
/// header. Rate limiting, server errors and network failures are
/// transient; any other client error is a decline.
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpPaymentGateway {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Transient`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Transient(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        let response = self
            .client
            .post(format!("{}/charges", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&ChargeBody {
                amount_cents: request.amount.amount_cents,
                currency: &request.amount.currency,
                reference: &request.reference,
            })
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let body: ChargeResponse = response
                .json()
                .await
                .map_err(|e| GatewayError::Transient(format!("unreadable charge response: {e}")))?;
            return Ok(ChargeReceipt { gateway_ref: body.id });
        }

        let detail = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(GatewayError::Transient(format!("{status}: {detail}")))
        } else {
            Err(GatewayError::Declined(format!("{status}: {detail}")))
        }
    }
}

#[derive(Default)]
struct MockState {
    charges: HashMap<String, String>,
    calls: Vec<ChargeRequest>,
    decline: Option<String>,
    failures: usize,
}

/// In-process gateway for development and tests.
///
/// Collapses repeated idempotency keys like a real gateway and records
/// every call. With [`MockPaymentGateway::settling_into`], each new charge
/// is also reported on a channel so a caller can deliver its callback.
#[derive(Clone, Default)]
pub struct MockPaymentGateway {
    state: Arc<Mutex<MockState>>,
    settlements: Option<mpsc::UnboundedSender<String>>,
}

impl MockPaymentGateway {
    /// Create a gateway that accepts every charge.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the gateway reference of every new charge on `sender`.
    #[must_use]
    pub fn settling_into(mut self, sender: mpsc::UnboundedSender<String>) -> Self {
        self.settlements = Some(sender);
        self
    }

    /// Decline every following charge with `reason`.
    pub fn decline_all(&self, reason: impl Into<String>) {
        self.lock().decline = Some(reason.into());
    }

    /// Fail the next `count` calls with a transient error.
    pub fn fail_next(&self, count: usize) {
        self.lock().failures = count;
    }

    /// Every request received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ChargeRequest> {
        self.lock().calls.clone()
    }

    /// Distinct charges created.
    #[must_use]
    pub fn charge_count(&self) -> usize {
        self.lock().charges.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        let new_charge = {
            let mut state = self.lock();
            state.calls.push(request.clone());
            if state.failures > 0 {
                state.failures -= 1;
                return Err(GatewayError::Transient("mock gateway unavailable".to_string()));
            }
            if let Some(reason) = &state.decline {
                return Err(GatewayError::Declined(reason.clone()));
            }
            if let Some(existing) = state.charges.get(&request.idempotency_key) {
                return Ok(ChargeReceipt {
                    gateway_ref: existing.clone(),
                });
            }
            let gateway_ref = format!("mock_ch_{}", uuid::Uuid::new_v4().simple());
            state.charges.insert(request.idempotency_key.clone(), gateway_ref.clone());
            gateway_ref
        };

        tracing::info!(
            gateway_ref = %new_charge,
            amount = %request.amount,
            reference = %request.reference,
            "Mock charge created"
        );
        if let Some(sender) = &self.settlements {
            let _ = sender.send(new_charge.clone());
        }
        Ok(ChargeReceipt { gateway_ref: new_charge })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request(key: &str) -> ChargeRequest {
        ChargeRequest {
            idempotency_key: key.to_string(),
            amount: Money::new(4500, "EUR"),
            reference: "r1".to_string(),
        }
    }

    #[tokio::test]
    async fn repeated_key_returns_the_same_charge() {
        let gateway = MockPaymentGateway::new();
        let first = gateway.create_charge(&request("k")).await.unwrap();
        let second = gateway.create_charge(&request("k")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(gateway.charge_count(), 1);
        assert_eq!(gateway.calls().len(), 2);
    }

    #[tokio::test]
    async fn failures_and_declines_are_distinguished() {
        let gateway = MockPaymentGateway::new();
        gateway.fail_next(1);
        assert!(gateway.create_charge(&request("k")).await.unwrap_err().is_transient());
        gateway.decline_all("card declined");
        assert_eq!(
            gateway.create_charge(&request("k")).await.unwrap_err(),
            GatewayError::Declined("card declined".into())
        );
    }

    #[tokio::test]
    async fn new_charges_are_reported_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gateway = MockPaymentGateway::new().settling_into(tx);
        let receipt = gateway.create_charge(&request("k")).await.unwrap();
        gateway.create_charge(&request("k")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), receipt.gateway_ref);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unreachable_gateway_is_transient() {
        let gateway = HttpPaymentGateway::new("http://127.0.0.1:9", "sk_test", Duration::from_millis(200)).unwrap();
        let error = gateway.create_charge(&request("k")).await.unwrap_err();
        assert!(error.is_transient());
    }
}
