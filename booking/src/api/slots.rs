//! Field service endpoints: `POST /slots` and `GET /slots/:id`.

use super::ApiError;
use crate::ledger::{LedgerError, Slot, SlotLedger};
use crate::types::{FieldId, SlotId, TimeRange};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use fieldbook_core::environment::Clock;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
struct FieldState {
    ledger: Arc<dyn SlotLedger>,
    clock: Arc<dyn Clock>,
}

/// Body of `POST /slots`.
#[derive(Debug, Deserialize)]
pub struct CreateSlot {
    /// Id to use; generated when absent
    #[serde(default)]
    pub slot_id: Option<SlotId>,
    /// Field the slot belongs to
    pub field_id: FieldId,
    /// Start (inclusive)
    pub starts_at: DateTime<Utc>,
    /// End (exclusive)
    pub ends_at: DateTime<Utc>,
}

/// Routes of the field service.
pub fn routes(ledger: Arc<dyn SlotLedger>, clock: Arc<dyn Clock>) -> Router {
    Router::new()
        .route("/slots", post(create_slot))
        .route("/slots/:id", get(get_slot))
        .with_state(FieldState { ledger, clock })
}

async fn create_slot(
    State(state): State<FieldState>,
    Json(body): Json<CreateSlot>,
) -> Result<(StatusCode, Json<Slot>), ApiError> {
    let time = TimeRange::new(body.starts_at, body.ends_at)
        .ok_or_else(|| ApiError::bad_request("starts_at must be before ends_at"))?;
    let slot = Slot::new(body.slot_id.unwrap_or_default(), body.field_id, time, state.clock.now());

    match state.ledger.create_slot(slot.clone()).await {
        Ok(()) => {
            tracing::info!(slot_id = %slot.id, field_id = %slot.field_id, "Slot created");
            Ok((StatusCode::CREATED, Json(slot)))
        }
        Err(e @ LedgerError::Duplicate(_)) => Err(ApiError::conflict(e.to_string())),
        Err(e) => Err(e.into()),
    }
}

async fn get_slot(State(state): State<FieldState>, Path(id): Path<Uuid>) -> Result<Json<Slot>, ApiError> {
    let id = SlotId::from_uuid(id);
    state
        .ledger
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Slot", id))
}
