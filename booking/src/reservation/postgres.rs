//! `PostgreSQL` reservation repository.

use super::{Reservation, ReservationRepository, ReservationStatus};
use crate::error::RepositoryError;
use crate::types::{Money, PaymentIntentId, ReservationId, SlotId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldbook_core::event::EventId;
use fieldbook_postgres::sql_limit;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use uuid::Uuid;

const COLUMNS: &str = "id, slot_id, user_id, status, idempotency_key, hold_version, payment_id, gateway_ref, \
                       amount_cents, currency, payment_deadline, failure_reason, last_event_id, status_history, \
                       created_at, updated_at";

/// [`ReservationRepository`] in the `reservations` table.
#[derive(Clone)]
pub struct PostgresReservationRepository {
    pool: PgPool,
}

impl PostgresReservationRepository {
    /// Create a repository on `pool`. Run [`crate::migrate`] first.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_where(&self, condition: &str, bind: impl FnOnce(Query<'_>) -> Query<'_>) -> Result<Vec<Reservation>, RepositoryError> {
        let sql = format!("SELECT {COLUMNS} FROM reservations WHERE {condition}");
        let rows = bind(sqlx::query(&sql)).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_reservation).collect()
    }
}

type Query<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn row_to_reservation(row: &PgRow) -> Result<Reservation, RepositoryError> {
    let status: String = row.try_get("status")?;
    let hold_version: Option<i64> = row.try_get("hold_version")?;
    let payment_id: Option<Uuid> = row.try_get("payment_id")?;
    let last_event_id: Option<Uuid> = row.try_get("last_event_id")?;
    let Json(status_history): Json<BTreeMap<ReservationStatus, DateTime<Utc>>> = row.try_get("status_history")?;

    Ok(Reservation {
        id: ReservationId::from_uuid(row.try_get("id")?),
        slot_id: SlotId::from_uuid(row.try_get("slot_id")?),
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        status: ReservationStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Storage(format!("unknown reservation status {status}")))?,
        idempotency_key: row.try_get("idempotency_key")?,
        hold_version: hold_version.and_then(|v| u64::try_from(v).ok()),
        payment_id: payment_id.map(PaymentIntentId::from_uuid),
        gateway_ref: row.try_get("gateway_ref")?,
        amount: Money::new(row.try_get("amount_cents")?, row.try_get::<String, _>("currency")?),
        payment_deadline: row.try_get("payment_deadline")?,
        failure_reason: row.try_get("failure_reason")?,
        last_event_id: last_event_id.map(EventId::from_uuid),
        status_history,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn hold_version(r: &Reservation) -> Option<i64> {
    r.hold_version.and_then(|v| i64::try_from(v).ok())
}

#[async_trait]
impl ReservationRepository for PostgresReservationRepository {
    async fn insert(&self, r: &Reservation) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r"
            INSERT INTO reservations (
                id, slot_id, user_id, status, idempotency_key, hold_version, payment_id, gateway_ref,
                amount_cents, currency, payment_deadline, failure_reason, last_event_id, status_history,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (idempotency_key) DO NOTHING
            ",
        )
        .bind(r.id.as_uuid())
        .bind(r.slot_id.as_uuid())
        .bind(r.user_id.as_uuid())
        .bind(r.status.as_str())
        .bind(&r.idempotency_key)
        .bind(hold_version(r))
        .bind(r.payment_id.map(|p| *p.as_uuid()))
        .bind(&r.gateway_ref)
        .bind(r.amount.amount_cents)
        .bind(&r.amount.currency)
        .bind(r.payment_deadline)
        .bind(&r.failure_reason)
        .bind(r.last_event_id.map(|e| *e.as_uuid()))
        .bind(Json(&r.status_history))
        .bind(r.created_at)
        .bind(r.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Duplicate(r.idempotency_key.clone()));
        }
        Ok(())
    }

    async fn get(&self, id: ReservationId) -> Result<Option<Reservation>, RepositoryError> {
        let mut found = self.fetch_where("id = $1", |q| q.bind(*id.as_uuid())).await?;
        Ok(found.pop())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Reservation>, RepositoryError> {
        let key = key.to_string();
        let mut found = self.fetch_where("idempotency_key = $1", |q| q.bind(key)).await?;
        Ok(found.pop())
    }

    async fn save(&self, r: &Reservation, expected: ReservationStatus) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE reservations
            SET status = $3, hold_version = $4, payment_id = $5, gateway_ref = $6,
                payment_deadline = $7, failure_reason = $8, last_event_id = $9,
                status_history = $10, updated_at = $11
            WHERE id = $1 AND status = $2
            ",
        )
        .bind(r.id.as_uuid())
        .bind(expected.as_str())
        .bind(r.status.as_str())
        .bind(hold_version(r))
        .bind(r.payment_id.map(|p| *p.as_uuid()))
        .bind(&r.gateway_ref)
        .bind(r.payment_deadline)
        .bind(&r.failure_reason)
        .bind(r.last_event_id.map(|e| *e.as_uuid()))
        .bind(Json(&r.status_history))
        .bind(r.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.get(r.id).await? {
            Some(_) => Err(RepositoryError::StaleWrite(r.id.to_string())),
            None => Err(RepositoryError::NotFound(r.id.to_string())),
        }
    }

    async fn payment_overdue(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reservation>, RepositoryError> {
        self.fetch_where(
            "status = 'PAYMENT_PENDING' AND payment_deadline <= $1 ORDER BY payment_deadline LIMIT $2",
            |q| q.bind(now).bind(sql_limit(limit)),
        )
        .await
    }

    async fn list_terminal_after(
        &self,
        after: (DateTime<Utc>, ReservationId),
        limit: usize,
    ) -> Result<Vec<Reservation>, RepositoryError> {
        let (updated_at, id) = after;
        self.fetch_where(
            "status IN ('CONFIRMED', 'PAYMENT_FAILED', 'HOLD_EXPIRED', 'REJECTED') AND (updated_at, id) > ($1, $2) \
             ORDER BY updated_at, id LIMIT $3",
            |q| q.bind(updated_at).bind(*id.as_uuid()).bind(sql_limit(limit)),
        )
        .await
    }

    async fn pending_hold_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>, RepositoryError> {
        self.fetch_where(
            "status = 'PENDING_HOLD' AND created_at < $1 ORDER BY created_at LIMIT $2",
            |q| q.bind(before).bind(sql_limit(limit)),
        )
        .await
    }
}
