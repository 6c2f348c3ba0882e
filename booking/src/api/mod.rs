//! HTTP surface of the three services.
//!
//! Each service contributes its own routes; [`app`] adds `/health` and
//! request tracing. The standalone binary merges all three route sets into
//! one application.

pub mod bookings;
pub mod error;
pub mod health;
pub mod slots;
pub mod webhooks;

pub use error::ApiError;
pub use health::{DeadLetterProbe, HealthProbe, PostgresProbe};

use axum::Router;
use fieldbook_core::environment::Clock;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Complete application: `routes` plus `/health` over `probes`, traced.
pub fn app(routes: Router, probes: Vec<Arc<dyn HealthProbe>>, clock: Arc<dyn Clock>) -> Router {
    routes
        .merge(health::routes(probes, clock))
        .layer(TraceLayer::new_for_http())
}
