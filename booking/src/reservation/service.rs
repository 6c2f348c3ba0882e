use super::{
    Reservation, ReservationAction, ReservationEffect, ReservationEnvironment, ReservationReducer,
    ReservationRepository,
};
use crate::error::{BookingError, RepositoryError};
use crate::publisher::{Outgoing, Publisher};
use crate::types::{Money, ReservationId, SlotId, UserId};
use fieldbook_core::reducer::{Effects, Reducer};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A client's request to book a slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    /// Slot to book
    pub slot_id: SlotId,
    /// Booking user
    pub user_id: UserId,
    /// Client-supplied key; repeating a request with it returns the same reservation
    pub idempotency_key: String,
}

/// Drives reservations: creates them and applies inbound events.
///
/// Every transition is persisted before any resulting event is published.
/// A crash in between is repaired by re-delivery: the inbound event matches
/// `last_event_id` and the reducer re-emits the same outbound events.
#[derive(Clone)]
pub struct ReservationService {
    repository: Arc<dyn ReservationRepository>,
    publisher: Publisher,
    env: ReservationEnvironment,
    price: Money,
}

impl ReservationService {
    /// Create the service. Every reservation is charged `price`.
    #[must_use]
    pub fn new(
        repository: Arc<dyn ReservationRepository>,
        publisher: Publisher,
        env: ReservationEnvironment,
        price: Money,
    ) -> Self {
        Self {
            repository,
            publisher,
            env,
            price,
        }
    }

    /// Create a reservation and ask the field service to hold its slot.
    ///
    /// Repeating a request with the same idempotency key returns the
    /// reservation the first request created.
    ///
    /// # Errors
    ///
    /// - [`BookingError::Invalid`] for an empty idempotency key
    /// - [`BookingError::Conflict`] if the key was used for another slot or user
    /// - [`BookingError::Transient`] if storage is unavailable
    pub async fn book(&self, request: BookingRequest) -> Result<Reservation, BookingError> {
        if request.idempotency_key.trim().is_empty() {
            return Err(BookingError::Invalid("idempotency key must not be empty".to_string()));
        }

        if let Some(existing) = self.repository.find_by_idempotency_key(&request.idempotency_key).await? {
            return self.repeat(existing, &request).await;
        }

        let now = self.env.clock.now();
        let reservation = Reservation::new(
            request.slot_id,
            request.user_id,
            request.idempotency_key.clone(),
            self.price.clone(),
            now,
        );
        match self.repository.insert(&reservation).await {
            Ok(()) => {}
            Err(RepositoryError::Duplicate(key)) => {
                let existing = self
                    .repository
                    .find_by_idempotency_key(&key)
                    .await?
                    .ok_or_else(|| BookingError::Transient(format!("reservation for key {key} vanished")))?;
                return self.repeat(existing, &request).await;
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            reservation_id = %reservation.id,
            slot_id = %reservation.slot_id,
            user_id = %reservation.user_id,
            "Reservation created"
        );
        metrics::counter!("reservation_transitions_total", "status" => reservation.status.as_str()).increment(1);
        self.publish_implied(&reservation).await;
        Ok(reservation)
    }

    async fn repeat(&self, existing: Reservation, request: &BookingRequest) -> Result<Reservation, BookingError> {
        if existing.slot_id != request.slot_id || existing.user_id != request.user_id {
            return Err(BookingError::Conflict(format!(
                "idempotency key {} belongs to another booking",
                request.idempotency_key
            )));
        }
        debug!(reservation_id = %existing.id, "Repeated booking request");
        if !existing.status.is_terminal() {
            self.publish_implied(&existing).await;
        }
        Ok(existing)
    }

    /// Re-publish what the current status stands for. Failures are left to
    /// reconciliation, which re-publishes stuck reservations.
    async fn publish_implied(&self, reservation: &Reservation) {
        let effects = ReservationReducer::implied_effects(reservation, &self.env);
        match self.seal(&effects, reservation) {
            Ok(outgoing) => {
                if let Err(e) = self.publisher.publish_all(&outgoing).await {
                    warn!(reservation_id = %reservation.id, error = %e, "Could not publish, reconciliation will retry");
                }
            }
            Err(e) => warn!(reservation_id = %reservation.id, error = %e, "Could not seal events"),
        }
    }

    /// Load a reservation.
    ///
    /// # Errors
    ///
    /// [`BookingError::Transient`] if storage is unavailable.
    pub async fn get(&self, id: ReservationId) -> Result<Option<Reservation>, BookingError> {
        Ok(self.repository.get(id).await?)
    }

    /// Apply one action to a reservation, persist the result and publish the
    /// events it implies.
    ///
    /// Returns the reservation as stored afterwards.
    ///
    /// # Errors
    ///
    /// - [`BookingError::NotFound`] if the reservation does not exist
    /// - [`BookingError::Transient`] if storage or the bus is unavailable, or
    ///   another worker changed the reservation concurrently
    pub async fn apply(&self, id: ReservationId, action: ReservationAction) -> Result<Reservation, BookingError> {
        let current = self
            .repository
            .get(id)
            .await?
            .ok_or_else(|| BookingError::NotFound(format!("reservation {id}")))?;

        let mut next = current.clone();
        let mut outgoing = Vec::new();
        let mut pending = VecDeque::from([action]);
        while let Some(action) = pending.pop_front() {
            let effects = ReservationReducer.reduce(&mut next, action, &self.env);
            for effect in &effects {
                if let ReservationEffect::Feedback(feedback) = effect {
                    pending.push_back(feedback.clone());
                }
            }
            outgoing.extend(self.seal(&effects, &next)?);
        }

        if next != current {
            self.repository.save(&next, current.status).await?;
            if next.status != current.status {
                info!(
                    reservation_id = %id,
                    from = %current.status,
                    to = %next.status,
                    reason = next.failure_reason.as_deref().unwrap_or_default(),
                    "Reservation transition"
                );
                for status in next
                    .status_history
                    .keys()
                    .filter(|s| !current.status_history.contains_key(*s))
                {
                    metrics::counter!("reservation_transitions_total", "status" => status.as_str()).increment(1);
                }
            }
        }

        self.publisher.publish_all(&outgoing).await?;
        Ok(next)
    }

    fn seal(&self, effects: &Effects<ReservationEffect>, reservation: &Reservation) -> Result<Vec<Outgoing>, BookingError> {
        let now = self.env.clock.now();
        let mut sealed = Vec::with_capacity(effects.len());
        for effect in effects {
            if let Some(outgoing) = effect.seal(now, reservation.last_event_id)? {
                sealed.push(outgoing);
            }
        }
        Ok(sealed)
    }

    /// The reducer environment.
    #[must_use]
    pub const fn environment(&self) -> &ReservationEnvironment {
        &self.env
    }

    /// Publisher shared with the sweeps.
    #[must_use]
    pub const fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Repository shared with the sweeps.
    #[must_use]
    pub fn repository(&self) -> Arc<dyn ReservationRepository> {
        Arc::clone(&self.repository)
    }
}
