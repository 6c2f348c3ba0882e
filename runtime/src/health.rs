//! Health reporting for service `/health` endpoints.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Health check status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,

    /// Component works but something needs attention (e.g. dead letters piling up)
    Degraded,

    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Get the worst status between two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

/// Health of one component.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Component name
    pub component: String,
    /// Current status
    pub status: HealthStatus,
    /// Details for non-healthy components
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheck {
    /// A healthy component.
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    /// A degraded component.
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
        }
    }

    /// An unhealthy component.
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
        }
    }
}

/// Aggregated health report; overall status is the worst of all checks.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,
    /// Individual checks
    pub checks: Vec<HealthCheck>,
    /// When the report was generated
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Combine checks into a report.
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>, timestamp: DateTime<Utc>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);
        Self {
            status,
            checks,
            timestamp,
        }
    }

    /// Whether the service can take traffic.
    #[must_use]
    pub const fn is_serving(&self) -> bool {
        !matches!(self.status, HealthStatus::Unhealthy)
    }
}
