//! Order service endpoints.
//!
//! - `POST /bookings` starts a reservation. The `Idempotency-Key` header is
//!   required; repeating a request with the same key returns the same
//!   reservation.
//! - `GET /bookings/:id` reads a reservation.

use super::ApiError;
use crate::reservation::{BookingRequest, Reservation, ReservationService};
use crate::types::{ReservationId, SlotId, UserId};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

/// Header carrying the client's idempotency key.
pub const IDEMPOTENCY_KEY: &str = "Idempotency-Key";

/// Body of `POST /bookings`.
#[derive(Debug, Deserialize)]
pub struct CreateBooking {
    /// Slot to book
    pub slot_id: SlotId,
    /// Booking user
    pub user_id: UserId,
}

/// Routes of the order service.
pub fn routes(service: ReservationService) -> Router {
    Router::new()
        .route("/bookings", post(create_booking))
        .route("/bookings/:id", get(get_booking))
        .with_state(service)
}

async fn create_booking(
    State(service): State<ReservationService>,
    headers: HeaderMap,
    Json(body): Json<CreateBooking>,
) -> Result<(StatusCode, Json<Reservation>), ApiError> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("missing {IDEMPOTENCY_KEY} header")))?;

    let reservation = service
        .book(BookingRequest {
            slot_id: body.slot_id,
            user_id: body.user_id,
            idempotency_key: idempotency_key.to_string(),
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(reservation)))
}

async fn get_booking(
    State(service): State<ReservationService>,
    Path(id): Path<Uuid>,
) -> Result<Json<Reservation>, ApiError> {
    let id = ReservationId::from_uuid(id);
    service
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Reservation", id))
}
