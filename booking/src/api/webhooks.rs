//! Payment service endpoint for gateway callbacks.
//!
//! `POST /webhooks/payments` takes the raw body so the signature is checked
//! over exactly the bytes the gateway signed.

use super::ApiError;
use crate::payment::{CallbackOutcome, SettlementAdapter};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

/// Header carrying the callback signature.
pub const SIGNATURE_HEADER: &str = "Gateway-Signature";

#[derive(Debug, Serialize)]
struct Acknowledgement {
    outcome: &'static str,
}

/// Routes of the payment service.
pub fn routes(adapter: SettlementAdapter) -> Router {
    Router::new()
        .route("/webhooks/payments", post(payment_callback))
        .with_state(adapter)
}

async fn payment_callback(
    State(adapter): State<SettlementAdapter>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Acknowledgement>), ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "INVALID_SIGNATURE", "missing signature"))?;

    match adapter.handle_webhook(signature, &body).await? {
        CallbackOutcome::Settled => Ok((StatusCode::OK, Json(Acknowledgement { outcome: "settled" }))),
        CallbackOutcome::Duplicate => Ok((StatusCode::OK, Json(Acknowledgement { outcome: "duplicate" }))),
        CallbackOutcome::NotFound => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "no charge with this gateway reference",
        )),
    }
}
