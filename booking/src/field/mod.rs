//! Field Service: applies slot commands to the ledger and reclaims lapsed holds.

mod handler;
mod sweep;

pub use handler::SlotCommandHandler;
pub use sweep::HoldExpirySweep;

/// Consumer name of the field service, used for its inbox and dead letters.
pub const CONSUMER: &str = "field-service";
