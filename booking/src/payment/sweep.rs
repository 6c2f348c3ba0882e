use super::{PaymentIntentRepository, SettlementAdapter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldbook_core::error::HandlerError;
use fieldbook_runtime::Sweep;
use std::sync::Arc;

/// Expires intents that got no callback before their settlement deadline
/// and announces them as failed.
///
/// A callback arriving after expiry finds a final intent and is answered
/// as a duplicate.
pub struct SettlementExpirySweep {
    adapter: SettlementAdapter,
    repository: Arc<dyn PaymentIntentRepository>,
    batch_size: usize,
}

impl SettlementExpirySweep {
    /// Create the sweep, expiring at most `batch_size` intents per pass.
    #[must_use]
    pub fn new(adapter: SettlementAdapter, batch_size: usize) -> Self {
        Self {
            repository: adapter.repository(),
            adapter,
            batch_size,
        }
    }
}

#[async_trait]
impl Sweep for SettlementExpirySweep {
    fn name(&self) -> &'static str {
        "settlement_expiry"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<usize, HandlerError> {
        let overdue = self
            .repository
            .settling_overdue(now, self.batch_size)
            .await
            .map_err(|e| HandlerError::transient(e.to_string()))?;

        let mut expired = 0;
        for intent in overdue {
            let Some(next) = intent.expire(now) else {
                continue;
            };
            match self.repository.transition(&next, intent.status).await {
                Ok(true) => {}
                // A callback got there first.
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(payment_id = %intent.id, error = %e, "Could not expire payment intent");
                    continue;
                }
            }
            tracing::info!(
                payment_id = %next.id,
                reservation_id = %next.reservation_id,
                "Payment settlement timed out"
            );
            expired += 1;
            if let Err(e) = self.adapter.announce(&next).await {
                tracing::error!(payment_id = %next.id, error = %e, "Could not announce expired payment");
            }
        }
        Ok(expired)
    }
}
