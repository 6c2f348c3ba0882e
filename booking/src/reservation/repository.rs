use super::{Reservation, ReservationStatus};
use crate::error::RepositoryError;
use crate::types::ReservationId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Storage of reservations.
///
/// Writes are conditional on the status that was read, so two workers
/// applying events to one reservation cannot both win.
#[async_trait]
pub trait ReservationRepository: Send + Sync {
    /// Store a new reservation.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Duplicate`] if its idempotency key is taken.
    async fn insert(&self, reservation: &Reservation) -> Result<(), RepositoryError>;

    /// Load a reservation.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Storage`] if the store is unavailable.
    async fn get(&self, id: ReservationId) -> Result<Option<Reservation>, RepositoryError>;

    /// Load the reservation created with `key`.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Storage`] if the store is unavailable.
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Reservation>, RepositoryError>;

    /// Overwrite a reservation if its stored status is still `expected`.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::StaleWrite`] if the status changed,
    /// [`RepositoryError::NotFound`] if the reservation is gone.
    async fn save(&self, reservation: &Reservation, expected: ReservationStatus) -> Result<(), RepositoryError>;

    /// `PAYMENT_PENDING` reservations whose deadline is at or before `now`.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Storage`] if the store is unavailable.
    async fn payment_overdue(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reservation>, RepositoryError>;

    /// Terminal reservations ordered by `(updated_at, id)`, starting after
    /// the `after` position.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Storage`] if the store is unavailable.
    async fn list_terminal_after(
        &self,
        after: (DateTime<Utc>, ReservationId),
        limit: usize,
    ) -> Result<Vec<Reservation>, RepositoryError>;

    /// `PENDING_HOLD` reservations created before `before`.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Storage`] if the store is unavailable.
    async fn pending_hold_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>, RepositoryError>;
}

#[derive(Default)]
struct Tables {
    reservations: HashMap<ReservationId, Reservation>,
    by_key: HashMap<String, ReservationId>,
}

/// [`ReservationRepository`] in process memory.
#[derive(Clone, Default)]
pub struct InMemoryReservationRepository {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryReservationRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn select<K: Ord>(&self, limit: usize, filter: impl Fn(&Reservation) -> bool, order: impl Fn(&Reservation) -> K) -> Vec<Reservation> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<_> = tables.reservations.values().filter(|r| filter(r)).cloned().collect();
        matching.sort_by_key(|r| order(r));
        matching.truncate(limit);
        matching
    }
}

#[async_trait]
impl ReservationRepository for InMemoryReservationRepository {
    async fn insert(&self, reservation: &Reservation) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        if tables.by_key.contains_key(&reservation.idempotency_key) {
            return Err(RepositoryError::Duplicate(reservation.idempotency_key.clone()));
        }
        tables.by_key.insert(reservation.idempotency_key.clone(), reservation.id);
        tables.reservations.insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn get(&self, id: ReservationId) -> Result<Option<Reservation>, RepositoryError> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.reservations.get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Reservation>, RepositoryError> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .by_key
            .get(key)
            .and_then(|id| tables.reservations.get(id))
            .cloned())
    }

    async fn save(&self, reservation: &Reservation, expected: ReservationStatus) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = tables
            .reservations
            .get_mut(&reservation.id)
            .ok_or_else(|| RepositoryError::NotFound(reservation.id.to_string()))?;
        if stored.status != expected {
            return Err(RepositoryError::StaleWrite(reservation.id.to_string()));
        }
        *stored = reservation.clone();
        Ok(())
    }

    async fn payment_overdue(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reservation>, RepositoryError> {
        Ok(self.select(
            limit,
            |r| r.status == ReservationStatus::PaymentPending && r.payment_deadline.is_some_and(|d| d <= now),
            |r| r.payment_deadline.unwrap_or(r.updated_at),
        ))
    }

    async fn list_terminal_after(
        &self,
        after: (DateTime<Utc>, ReservationId),
        limit: usize,
    ) -> Result<Vec<Reservation>, RepositoryError> {
        Ok(self.select(
            limit,
            |r| r.status.is_terminal() && (r.updated_at, r.id) > after,
            |r| (r.updated_at, r.id),
        ))
    }

    async fn pending_hold_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>, RepositoryError> {
        Ok(self.select(
            limit,
            |r| r.status == ReservationStatus::PendingHold && r.created_at < before,
            |r| r.created_at,
        ))
    }
}
