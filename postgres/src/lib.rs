//! `PostgreSQL` storage for the Fieldbook consumer infrastructure.
//!
//! This crate provides:
//!
//! - [`connect`]: pool construction that waits for the database to come up
//! - [`migrate`]: the `processed_events` and `failed_events` tables
//! - [`PostgresInbox`]: durable dedup markers for event consumers
//! - [`DeadLetterQueue`]: durable dead letters with an operator workflow
//!
//! Queries are built at runtime with `sqlx::query`, so building the crate
//! needs no live database.
//!
//! # Example
//!
//! ```ignore
//! use fieldbook_postgres::{PoolSettings, connect, migrate, PostgresInbox};
//!
//! let pool = connect("postgres://localhost/fieldbook", &PoolSettings::default()).await?;
//! migrate(&pool).await?;
//! let inbox = PostgresInbox::new(pool.clone());
//! ```

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use thiserror::Error;

pub mod dead_letter_queue;
pub mod inbox;

pub use dead_letter_queue::{DLQStatus, DeadLetterQueue, FailedEvent};
pub use inbox::PostgresInbox;

/// Errors from the Postgres layer.
#[derive(Error, Debug)]
pub enum PostgresError {
    /// The database rejected a query or could not be reached.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored value could not be interpreted.
    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Maximum pool size
    pub max_connections: u32,
    /// Connections kept open when idle
    pub min_connections: u32,
    /// How long to wait for a free connection
    pub acquire_timeout: Duration,
    /// How many times to try reaching the database at startup
    pub connect_attempts: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            connect_attempts: 10,
        }
    }
}

/// Open a pool, retrying while the database is still starting.
///
/// # Errors
///
/// Returns [`PostgresError::Database`] with the last connection error once
/// `connect_attempts` tries have failed.
pub async fn connect(url: &str, settings: &PoolSettings) -> Result<PgPool, PostgresError> {
    let mut attempt = 1;
    loop {
        let result = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect(url)
            .await;

        match result {
            Ok(pool) => {
                tracing::info!(max_connections = settings.max_connections, "Connected to Postgres");
                return Ok(pool);
            }
            Err(e) if attempt < settings.connect_attempts => {
                tracing::warn!(attempt, error = %e, "Postgres not reachable yet, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Create or upgrade the consumer infrastructure tables.
///
/// Applications keep their own migrations in the same database; migrations
/// this crate does not know about are ignored.
///
/// # Errors
///
/// Returns [`PostgresError::Migration`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), PostgresError> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await?;
    Ok(())
}

/// Convert a row count limit into the `BIGINT` Postgres expects.
#[must_use]
pub fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
