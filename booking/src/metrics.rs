//! Business metrics of the booking services.
//!
//! ## Counters
//! - `ledger_holds_total{outcome}` - hold attempts by outcome (held, conflict, not_found, expired)
//! - `reservation_transitions_total{status}` - reservations entering each status
//! - `payment_callbacks_total{outcome}` - gateway callbacks (settled, duplicate, not_found, rejected)
//!
//! Consumer, dead letter and sweep metrics are registered by
//! [`fieldbook_runtime::metrics::MetricsServer`].

use metrics::describe_counter;

/// Register descriptions of the business metrics.
///
/// Call once at startup, after the metrics server installed its recorder.
pub fn register_business_metrics() {
    describe_counter!("ledger_holds_total", "Slot hold attempts by outcome");
    describe_counter!(
        "reservation_transitions_total",
        "Reservations entering each status"
    );
    describe_counter!(
        "payment_callbacks_total",
        "Gateway callbacks by outcome (settled, duplicate, not_found, rejected)"
    );

    tracing::info!("Business metrics registered");
}
