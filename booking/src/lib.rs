//! # Fieldbook booking services
//!
//! Soccer-field slot booking across three services that talk only through
//! the event bus:
//!
//! - **Field service** ([`field`], [`ledger`]): owns the Slot Ledger. At most
//!   one reservation holds or owns a slot; holds lapse on their own.
//! - **Order service** ([`reservation`]): owns reservations and drives each
//!   one through its state machine.
//! - **Payment service** ([`payment`]): owns payment intents, charges the
//!   gateway and turns its callbacks into payment outcomes.
//!
//! Every handler is idempotent under at-least-once delivery: consequences of
//! an inbound event carry ids derived from it, so a replay publishes the same
//! events and downstream inboxes collapse them.
//!
//! ## Booking flow
//!
//! ```text
//! POST /bookings ─→ SlotHoldRequested ─→ SlotHeld ─→ PaymentRequested ─→ (gateway) ─→ callback
//!                                                                                       │
//!        CONFIRMED ←─ SlotConfirmed ←─ PaymentSucceeded ←───────────────────────────────┘
//! ```

pub mod api;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod events;
pub mod field;
pub mod ledger;
pub mod metrics;
pub mod payment;
pub mod publisher;
pub mod reservation;
pub mod types;

pub use config::Config;
pub use error::BookingError;

/// Create or upgrade the booking tables (slots, reservations, payment intents).
///
/// Run after [`fieldbook_postgres::migrate`]; both share one migration
/// history and ignore each other's entries.
///
/// # Errors
///
/// Returns [`fieldbook_postgres::PostgresError::Migration`] if a migration fails.
pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), fieldbook_postgres::PostgresError> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await?;
    Ok(())
}
