//! `GET /health`: 200 while every probe is healthy or degraded, 503 otherwise.

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use fieldbook_core::environment::Clock;
use fieldbook_postgres::DeadLetterQueue;
use fieldbook_runtime::InMemoryDeadLetterQueue;
use fieldbook_runtime::health::{HealthCheck, HealthReport};
use sqlx::PgPool;
use std::sync::Arc;

/// One component reported by `/health`.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Check the component now.
    async fn check(&self) -> HealthCheck;
}

/// Database reachability.
pub struct PostgresProbe {
    pool: PgPool,
}

impl PostgresProbe {
    /// Probe `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HealthProbe for PostgresProbe {
    async fn check(&self) -> HealthCheck {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => HealthCheck::healthy("postgres"),
            Err(e) => HealthCheck::unhealthy("postgres", e.to_string()),
        }
    }
}

/// Dead letters waiting for an operator. Any backlog degrades the service.
pub enum DeadLetterProbe {
    /// Process-local queue
    Memory(InMemoryDeadLetterQueue),
    /// `failed_events` table
    Postgres(DeadLetterQueue),
}

#[async_trait]
impl HealthProbe for DeadLetterProbe {
    async fn check(&self) -> HealthCheck {
        let pending = match self {
            Self::Memory(queue) => Ok(queue.len()),
            Self::Postgres(queue) => queue
                .count_pending()
                .await
                .map(|count| usize::try_from(count).unwrap_or_default()),
        };
        match pending {
            Ok(0) => HealthCheck::healthy("dead_letters"),
            Ok(count) => HealthCheck::degraded("dead_letters", format!("{count} dead letters pending")),
            Err(e) => HealthCheck::unhealthy("dead_letters", e.to_string()),
        }
    }
}

#[derive(Clone)]
struct HealthState {
    probes: Arc<Vec<Arc<dyn HealthProbe>>>,
    clock: Arc<dyn Clock>,
}

/// `GET /health` over `probes`.
pub fn routes(probes: Vec<Arc<dyn HealthProbe>>, clock: Arc<dyn Clock>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState {
        probes: Arc::new(probes),
        clock,
    })
}

async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthReport>) {
    let checks = futures::future::join_all(state.probes.iter().map(|probe| probe.check())).await;
    let report = HealthReport::new(checks, state.clock.now());
    let status = if report.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}
