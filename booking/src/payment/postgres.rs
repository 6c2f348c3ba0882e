//! `PostgreSQL` payment intent repository.

use super::{PaymentIntent, PaymentIntentRepository, PaymentStatus};
use crate::error::RepositoryError;
use crate::types::{Money, PaymentIntentId, ReservationId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldbook_postgres::sql_limit;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// [`PaymentIntentRepository`] in the `payment_intents` table.
///
/// The partial unique index on `(reservation_id) WHERE status = 'SUCCEEDED'`
/// is what makes settlement at-most-once per reservation, whatever the
/// callers do.
#[derive(Clone)]
pub struct PostgresPaymentIntentRepository {
    pool: PgPool,
}

impl PostgresPaymentIntentRepository {
    /// Create a repository on `pool`. Run [`crate::migrate`] first.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_by(&self, column: &str, value: String) -> Result<Option<PaymentIntent>, RepositoryError> {
        let sql = format!(
            "SELECT id, reservation_id, amount_cents, currency, status, gateway_ref, idempotency_key, \
             settle_deadline, failure_reason, created_at, updated_at \
             FROM payment_intents WHERE {column} = $1"
        );
        let row = sqlx::query(&sql).bind(value).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_intent).transpose()
    }
}

fn row_to_intent(row: &PgRow) -> Result<PaymentIntent, RepositoryError> {
    let status: String = row.try_get("status")?;
    Ok(PaymentIntent {
        id: PaymentIntentId::from_uuid(row.try_get("id")?),
        reservation_id: ReservationId::from_uuid(row.try_get("reservation_id")?),
        amount: Money::new(row.try_get("amount_cents")?, row.try_get::<String, _>("currency")?),
        status: PaymentStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Storage(format!("unknown payment status {status}")))?,
        gateway_ref: row.try_get("gateway_ref")?,
        idempotency_key: row.try_get("idempotency_key")?,
        settle_deadline: row.try_get("settle_deadline")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl PaymentIntentRepository for PostgresPaymentIntentRepository {
    async fn create_or_get(&self, intent: PaymentIntent) -> Result<PaymentIntent, RepositoryError> {
        sqlx::query(
            r"
            INSERT INTO payment_intents (
                id, reservation_id, amount_cents, currency, status, gateway_ref, idempotency_key,
                settle_deadline, failure_reason, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            ON CONFLICT (idempotency_key) DO NOTHING
            ",
        )
        .bind(intent.id.as_uuid())
        .bind(intent.reservation_id.as_uuid())
        .bind(intent.amount.amount_cents)
        .bind(&intent.amount.currency)
        .bind(intent.status.as_str())
        .bind(&intent.gateway_ref)
        .bind(&intent.idempotency_key)
        .bind(intent.settle_deadline)
        .bind(&intent.failure_reason)
        .bind(intent.created_at)
        .execute(&self.pool)
        .await?;

        self.fetch_one_by("idempotency_key", intent.idempotency_key.clone())
            .await?
            .ok_or_else(|| RepositoryError::NotFound(intent.idempotency_key))
    }

    async fn get(&self, id: PaymentIntentId) -> Result<Option<PaymentIntent>, RepositoryError> {
        let row = sqlx::query(
            r"
            SELECT id, reservation_id, amount_cents, currency, status, gateway_ref, idempotency_key,
                   settle_deadline, failure_reason, created_at, updated_at
            FROM payment_intents
            WHERE id = $1
            ",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_intent).transpose()
    }

    async fn get_by_gateway_ref(&self, gateway_ref: &str) -> Result<Option<PaymentIntent>, RepositoryError> {
        self.fetch_one_by("gateway_ref", gateway_ref.to_string()).await
    }

    async fn transition(&self, next: &PaymentIntent, from: PaymentStatus) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE payment_intents
            SET status = $3, gateway_ref = $4, failure_reason = $5, updated_at = $6
            WHERE id = $1 AND status = $2
            ",
        )
        .bind(next.id.as_uuid())
        .bind(from.as_str())
        .bind(next.status.as_str())
        .bind(&next.gateway_ref)
        .bind(&next.failure_reason)
        .bind(next.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() == 1),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(RepositoryError::Duplicate(format!("settled payment for {}", next.reservation_id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn settling_overdue(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PaymentIntent>, RepositoryError> {
        let rows = sqlx::query(
            r"
            SELECT id, reservation_id, amount_cents, currency, status, gateway_ref, idempotency_key,
                   settle_deadline, failure_reason, created_at, updated_at
            FROM payment_intents
            WHERE status IN ('CREATED', 'SETTLING') AND settle_deadline <= $1
            ORDER BY settle_deadline
            LIMIT $2
            ",
        )
        .bind(now)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_intent).collect()
    }
}
