use super::{PaymentIntent, PaymentStatus};
use crate::error::RepositoryError;
use crate::types::PaymentIntentId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Storage of payment intents.
#[async_trait]
pub trait PaymentIntentRepository: Send + Sync {
    /// Store `intent` unless one with its idempotency key exists; return the
    /// stored intent either way.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Storage`] if the store is unavailable.
    async fn create_or_get(&self, intent: PaymentIntent) -> Result<PaymentIntent, RepositoryError>;

    /// Load an intent.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Storage`] if the store is unavailable.
    async fn get(&self, id: PaymentIntentId) -> Result<Option<PaymentIntent>, RepositoryError>;

    /// Load the intent the gateway knows as `gateway_ref`.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Storage`] if the store is unavailable.
    async fn get_by_gateway_ref(&self, gateway_ref: &str) -> Result<Option<PaymentIntent>, RepositoryError>;

    /// Store `next` if the intent is still in `from`. Returns whether it was stored.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Duplicate`] if a second intent of the reservation
    /// would succeed, [`RepositoryError::Storage`] if the store is unavailable.
    async fn transition(&self, next: &PaymentIntent, from: PaymentStatus) -> Result<bool, RepositoryError>;

    /// Unsettled intents whose deadline is at or before `now`.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Storage`] if the store is unavailable.
    async fn settling_overdue(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PaymentIntent>, RepositoryError>;
}

/// [`PaymentIntentRepository`] in process memory.
#[derive(Clone, Default)]
pub struct InMemoryPaymentIntentRepository {
    intents: Arc<Mutex<HashMap<PaymentIntentId, PaymentIntent>>>,
}

impl InMemoryPaymentIntentRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn find(&self, matches: impl Fn(&PaymentIntent) -> bool) -> Option<PaymentIntent> {
        self.intents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|i| matches(i))
            .cloned()
    }
}

#[async_trait]
impl PaymentIntentRepository for InMemoryPaymentIntentRepository {
    async fn create_or_get(&self, intent: PaymentIntent) -> Result<PaymentIntent, RepositoryError> {
        let mut intents = self.intents.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = intents.values().find(|i| i.idempotency_key == intent.idempotency_key) {
            return Ok(existing.clone());
        }
        intents.insert(intent.id, intent.clone());
        Ok(intent)
    }

    async fn get(&self, id: PaymentIntentId) -> Result<Option<PaymentIntent>, RepositoryError> {
        Ok(self.intents.lock().unwrap_or_else(PoisonError::into_inner).get(&id).cloned())
    }

    async fn get_by_gateway_ref(&self, gateway_ref: &str) -> Result<Option<PaymentIntent>, RepositoryError> {
        Ok(self.find(|i| i.gateway_ref.as_deref() == Some(gateway_ref)))
    }

    async fn transition(&self, next: &PaymentIntent, from: PaymentStatus) -> Result<bool, RepositoryError> {
        let mut intents = self.intents.lock().unwrap_or_else(PoisonError::into_inner);
        if next.status == PaymentStatus::Succeeded
            && intents.values().any(|i| {
                i.id != next.id && i.reservation_id == next.reservation_id && i.status == PaymentStatus::Succeeded
            })
        {
            return Err(RepositoryError::Duplicate(format!("settled payment for {}", next.reservation_id)));
        }
        match intents.get_mut(&next.id) {
            Some(stored) if stored.status == from => {
                *stored = next.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound(next.id.to_string())),
        }
    }

    async fn settling_overdue(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PaymentIntent>, RepositoryError> {
        let intents = self.intents.lock().unwrap_or_else(PoisonError::into_inner);
        let mut overdue: Vec<_> = intents
            .values()
            .filter(|i| !i.status.is_terminal() && i.settle_deadline <= now)
            .cloned()
            .collect();
        overdue.sort_by_key(|i| i.settle_deadline);
        overdue.truncate(limit);
        Ok(overdue)
    }
}
