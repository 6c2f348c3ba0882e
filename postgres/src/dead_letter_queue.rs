//! Dead Letter Queue (DLQ) for envelopes consumers gave up on.
//!
//! Provides persistent storage of failed envelopes plus the operator
//! workflow around them: list what is pending, inspect an entry, and mark it
//! resolved (after manual reprocessing) or discarded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldbook_core::event::EventId;
use fieldbook_runtime::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{PostgresError, sql_limit};

/// Status of a failed envelope in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Waiting for investigation
    Pending,
    /// Reprocessed successfully
    Resolved,
    /// Permanently discarded
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::InvalidData`] if the string is not a known status.
    pub fn parse(s: &str) -> Result<Self, PostgresError> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(PostgresError::InvalidData(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// A stored dead letter with its workflow state.
#[derive(Debug, Clone)]
pub struct FailedEvent {
    /// Unique identifier for this DLQ entry
    pub id: i64,
    /// The dead letter as reported by the consumer
    pub letter: DeadLetter,
    /// Current workflow status
    pub status: DLQStatus,
    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,
    /// Operator notes
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-backed Dead Letter Queue.
///
/// # Example
///
/// ```no_run
/// use fieldbook_postgres::DeadLetterQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
/// for entry in dlq.list_pending(100).await? {
///     println!("{}: {}", entry.letter.event_type, entry.letter.error_message);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Store a dead letter.
    ///
    /// Returns the id of the new entry.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if the insert fails.
    pub async fn add_entry(&self, letter: &DeadLetter) -> Result<i64, PostgresError> {
        let attempts = i32::try_from(letter.attempts).unwrap_or(i32::MAX);
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_events (
                consumer, event_id, event_type, partition_key, payload,
                error_kind, error_message, attempts, failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            ",
        )
        .bind(&letter.consumer)
        .bind(letter.event_id.map(|id| *id.as_uuid()))
        .bind(&letter.event_type)
        .bind(&letter.key)
        .bind(&letter.payload)
        .bind(&letter.error_kind)
        .bind(&letter.error_message)
        .bind(attempts)
        .bind(letter.failed_at)
        .fetch_one(&self.pool)
        .await?;

        tracing::warn!(
            dlq_id = id,
            consumer = %letter.consumer,
            event_type = %letter.event_type,
            error = %letter.error_message,
            attempts = letter.attempts,
            "Envelope added to Dead Letter Queue"
        );

        Ok(id)
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedEvent>, PostgresError> {
        let rows = sqlx::query(
            r"
            SELECT id, consumer, event_id, event_type, partition_key, payload,
                   error_kind, error_message, attempts, failed_at,
                   status, resolved_at, resolution_notes
            FROM failed_events
            WHERE status = 'pending'
            ORDER BY failed_at ASC
            LIMIT $1
            ",
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_failed_event).collect()
    }

    /// Get one entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if the query fails or the entry does not exist.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedEvent, PostgresError> {
        let row = sqlx::query(
            r"
            SELECT id, consumer, event_id, event_type, partition_key, payload,
                   error_kind, error_message, attempts, failed_at,
                   status, resolved_at, resolution_notes
            FROM failed_events
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_failed_event(&row)
    }

    /// Mark an entry resolved.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if the update fails.
    pub async fn mark_resolved(&self, id: i64, notes: Option<&str>) -> Result<(), PostgresError> {
        self.close(id, DLQStatus::Resolved, notes).await?;
        tracing::info!(dlq_id = id, "DLQ entry marked as resolved");
        Ok(())
    }

    /// Mark an entry permanently discarded.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), PostgresError> {
        self.close(id, DLQStatus::Discarded, Some(reason)).await?;
        tracing::warn!(dlq_id = id, reason, "DLQ entry marked as discarded");
        Ok(())
    }

    async fn close(&self, id: i64, status: DLQStatus, notes: Option<&str>) -> Result<(), PostgresError> {
        sqlx::query(
            r"
            UPDATE failed_events
            SET status = $1, resolved_at = now(), resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(status.as_str())
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of pending entries, for health checks.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, PostgresError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_events WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    fn row_to_failed_event(row: &sqlx::postgres::PgRow) -> Result<FailedEvent, PostgresError> {
        let status: String = row.try_get("status")?;
        let event_id: Option<Uuid> = row.try_get("event_id")?;
        let attempts: i32 = row.try_get("attempts")?;

        Ok(FailedEvent {
            id: row.try_get("id")?,
            letter: DeadLetter {
                consumer: row.try_get("consumer")?,
                event_id: event_id.map(EventId::from_uuid),
                event_type: row.try_get("event_type")?,
                key: row.try_get("partition_key")?,
                payload: row.try_get("payload")?,
                error_kind: row.try_get("error_kind")?,
                error_message: row.try_get("error_message")?,
                attempts: usize::try_from(attempts).unwrap_or_default(),
                failed_at: row.try_get("failed_at")?,
            },
            status: DLQStatus::parse(&status)?,
            resolved_at: row.try_get("resolved_at")?,
            resolution_notes: row.try_get("resolution_notes")?,
        })
    }
}

#[async_trait]
impl DeadLetterSink for DeadLetterQueue {
    async fn push(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        self.add_entry(&letter)
            .await
            .map(|_| ())
            .map_err(|e| DeadLetterError::Storage(e.to_string()))
    }
}
