//! Read-only access to slot state for services that do not own the ledger.

use super::{InMemorySlotLedger, LedgerError, PostgresSlotLedger, Slot, SlotLedger};
use crate::types::SlotId;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

/// Read-only view of the Slot Ledger, used by reconciliation.
#[async_trait]
pub trait SlotStatusView: Send + Sync {
    /// Current state of a slot, `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] when the ledger cannot be reached.
    async fn slot(&self, slot_id: SlotId) -> Result<Option<Slot>, LedgerError>;
}

#[async_trait]
impl SlotStatusView for InMemorySlotLedger {
    async fn slot(&self, slot_id: SlotId) -> Result<Option<Slot>, LedgerError> {
        self.get(slot_id).await
    }
}

#[async_trait]
impl SlotStatusView for PostgresSlotLedger {
    async fn slot(&self, slot_id: SlotId) -> Result<Option<Slot>, LedgerError> {
        self.get(slot_id).await
    }
}

/// [`SlotStatusView`] over the field service's `GET /slots/{id}`.
#[derive(Clone)]
pub struct HttpSlotStatusView {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSlotStatusView {
    /// Create a view of the field service at `base_url`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Storage(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SlotStatusView for HttpSlotStatusView {
    async fn slot(&self, slot_id: SlotId) -> Result<Option<Slot>, LedgerError> {
        let response = self
            .client
            .get(format!("{}/slots/{slot_id}", self.base_url))
            .send()
            .await
            .map_err(|e| LedgerError::Storage(format!("field service unreachable: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<Slot>()
                .await
                .map(Some)
                .map_err(|e| LedgerError::Storage(format!("malformed slot response: {e}"))),
            status => Err(LedgerError::Storage(format!("field service answered {status}"))),
        }
    }
}
