//! `PostgreSQL` slot ledger.

use super::{ConfirmOutcome, Decision, HoldOutcome, LedgerError, ReclaimedHold, ReleaseOutcome, Slot, SlotLedger, SlotStatus};
use crate::types::{FieldId, ReservationId, SlotId, TimeRange};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fieldbook_postgres::sql_limit;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Reads before giving up on a slot that keeps changing under us.
const CAS_ATTEMPTS: usize = 3;

/// [`SlotLedger`] in the `slots` table.
///
/// A transition reads the row, decides with the pure [`Slot`] functions and
/// writes with `UPDATE ... WHERE id = $1 AND version = $2`. Zero affected
/// rows means another writer got there first; the row is read again and the
/// decision retaken, a bounded number of times.
#[derive(Clone)]
pub struct PostgresSlotLedger {
    pool: PgPool,
}

impl PostgresSlotLedger {
    /// Create a ledger on `pool`. Run [`crate::migrate`] first.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn apply<O: Copy>(
        &self,
        slot_id: SlotId,
        lost_race: O,
        not_found: O,
        decide: impl Fn(&Slot) -> Decision<O> + Send + Sync,
    ) -> Result<O, LedgerError> {
        for attempt in 1..=CAS_ATTEMPTS {
            let Some(current) = self.get(slot_id).await? else {
                return Ok(not_found);
            };
            let Decision { outcome, next } = decide(&current);
            let Some(next) = next else {
                return Ok(outcome);
            };
            if self.compare_and_set(current.version, &next).await? {
                return Ok(outcome);
            }
            tracing::debug!(slot_id = %slot_id, attempt, "Slot changed concurrently, re-reading");
        }
        Ok(lost_race)
    }

    async fn compare_and_set(&self, expected_version: u64, next: &Slot) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r"
            UPDATE slots
            SET status = $3, holder_order_id = $4, hold_expires_at = $5, version = $6, updated_at = $7
            WHERE id = $1 AND version = $2
            ",
        )
        .bind(next.id.as_uuid())
        .bind(to_db_version(expected_version))
        .bind(next.status.as_str())
        .bind(next.holder.map(|h| *h.as_uuid()))
        .bind(next.hold_expires_at)
        .bind(to_db_version(next.version))
        .bind(next.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    fn row_to_slot(row: &PgRow) -> Result<Slot, LedgerError> {
        let status: String = row.try_get("status")?;
        let holder: Option<Uuid> = row.try_get("holder_order_id")?;
        let version: i64 = row.try_get("version")?;
        let time = TimeRange::new(row.try_get("starts_at")?, row.try_get("ends_at")?)
            .ok_or_else(|| LedgerError::Storage("slot with empty time range".to_string()))?;

        Ok(Slot {
            id: SlotId::from_uuid(row.try_get("id")?),
            field_id: FieldId::from_uuid(row.try_get("field_id")?),
            time,
            status: SlotStatus::parse(&status)
                .ok_or_else(|| LedgerError::Storage(format!("unknown slot status {status}")))?,
            holder: holder.map(ReservationId::from_uuid),
            hold_expires_at: row.try_get("hold_expires_at")?,
            version: from_db_version(version),
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn to_db_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn from_db_version(version: i64) -> u64 {
    u64::try_from(version).unwrap_or_default()
}

#[async_trait]
impl SlotLedger for PostgresSlotLedger {
    async fn create_slot(&self, slot: Slot) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r"
            INSERT INTO slots (
                id, field_id, starts_at, ends_at, status, holder_order_id,
                hold_expires_at, version, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(slot.id.as_uuid())
        .bind(slot.field_id.as_uuid())
        .bind(slot.time.starts_at)
        .bind(slot.time.ends_at)
        .bind(slot.status.as_str())
        .bind(slot.holder.map(|h| *h.as_uuid()))
        .bind(slot.hold_expires_at)
        .bind(to_db_version(slot.version))
        .bind(slot.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::Duplicate(slot.id));
        }
        Ok(())
    }

    async fn get(&self, slot_id: SlotId) -> Result<Option<Slot>, LedgerError> {
        let row = sqlx::query(
            r"
            SELECT id, field_id, starts_at, ends_at, status, holder_order_id,
                   hold_expires_at, version, updated_at
            FROM slots
            WHERE id = $1
            ",
        )
        .bind(slot_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_slot).transpose()
    }

    async fn try_hold(
        &self,
        slot_id: SlotId,
        order_id: ReservationId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<HoldOutcome, LedgerError> {
        self.apply(slot_id, HoldOutcome::Conflict, HoldOutcome::NotFound, |slot| {
            slot.hold(order_id, ttl, now)
        })
        .await
    }

    async fn confirm(
        &self,
        slot_id: SlotId,
        order_id: ReservationId,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<ConfirmOutcome, LedgerError> {
        self.apply(slot_id, ConfirmOutcome::Conflict, ConfirmOutcome::NotFound, |slot| {
            slot.confirm(order_id, expected_version, now)
        })
        .await
    }

    async fn release(
        &self,
        slot_id: SlotId,
        order_id: ReservationId,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, LedgerError> {
        self.apply(slot_id, ReleaseOutcome::Conflict, ReleaseOutcome::NotFound, |slot| {
            slot.release(order_id, expected_version, now)
        })
        .await
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ReclaimedHold>, LedgerError> {
        let rows = sqlx::query(
            r"
            WITH expired AS (
                SELECT id, holder_order_id, version
                FROM slots
                WHERE status = 'HELD' AND hold_expires_at <= $1
                ORDER BY hold_expires_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE slots s
            SET status = 'FREE', holder_order_id = NULL, hold_expires_at = NULL,
                version = s.version + 1, updated_at = $1
            FROM expired e
            WHERE s.id = e.id AND s.version = e.version
            RETURNING e.id, e.holder_order_id, e.version
            ",
        )
        .bind(now)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ReclaimedHold, LedgerError> {
                let holder: Uuid = row.try_get("holder_order_id")?;
                let version: i64 = row.try_get("version")?;
                Ok(ReclaimedHold {
                    slot_id: SlotId::from_uuid(row.try_get("id")?),
                    holder: ReservationId::from_uuid(holder),
                    hold_version: from_db_version(version),
                })
            })
            .collect()
    }
}
