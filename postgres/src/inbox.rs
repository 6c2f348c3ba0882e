//! Durable inbox markers in the `processed_events` table.

use fieldbook_core::event::EventId;
use fieldbook_core::inbox::{Inbox, InboxError};
use sqlx::PgPool;
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// [`Inbox`] stored in Postgres, one row per (consumer, key).
#[derive(Clone)]
pub struct PostgresInbox {
    pool: PgPool,
}

impl PostgresInbox {
    /// Create an inbox on `pool`. Run [`crate::migrate`] first.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl Inbox for PostgresInbox {
    fn last_processed<'a>(
        &'a self,
        consumer: &'a str,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EventId>, InboxError>> + Send + 'a>> {
        Box::pin(async move {
            let row: Option<(Uuid,)> = sqlx::query_as(
                "SELECT event_id FROM processed_events WHERE consumer = $1 AND partition_key = $2",
            )
            .bind(consumer)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| InboxError::Storage(e.to_string()))?;

            Ok(row.map(|(id,)| EventId::from_uuid(id)))
        })
    }

    fn record<'a>(
        &'a self,
        consumer: &'a str,
        key: &'a str,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<(), InboxError>> + Send + 'a>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO processed_events (consumer, partition_key, event_id, processed_at)
                VALUES ($1, $2, $3, now())
                ON CONFLICT (consumer, partition_key)
                DO UPDATE SET event_id = EXCLUDED.event_id, processed_at = EXCLUDED.processed_at
                ",
            )
            .bind(consumer)
            .bind(key)
            .bind(*event_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| InboxError::Storage(e.to_string()))?;

            Ok(())
        })
    }
}
