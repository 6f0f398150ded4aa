//! Operator-facing performance report shapes.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Aggregates for one measured operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub op: String,
    pub count: usize,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub avg_mem_delta_bytes: f64,
    /// Up to the 5 most recent error messages.
    pub recent_errors: Vec<String>,
}

/// Coarse system health buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemHealth {
    Good,
    Fair,
    Warning,
    Critical,
}

impl SystemHealth {
    /// Classifies from the recent one-hour error rate, recent average
    /// duration, and the current heap sample against its limit.
    ///
    /// A heap of 0 means the platform has no probe and never counts as
    /// over limit.
    pub fn classify(
        error_rate: f64,
        avg_duration_ms: f64,
        heap_bytes: u64,
        heap_limit_bytes: u64,
        alert_duration_ms: u64,
    ) -> Self {
        let heap_over = heap_bytes > 0 && heap_limit_bytes > 0 && heap_bytes > heap_limit_bytes;

        if error_rate > 0.25 || heap_over {
            Self::Critical
        } else if error_rate > 0.10 || avg_duration_ms > alert_duration_ms as f64 {
            Self::Warning
        } else if error_rate > 0.02 || avg_duration_ms > alert_duration_ms as f64 / 2.0 {
            Self::Fair
        } else {
            Self::Good
        }
    }
}

/// Full performance snapshot published for operators.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub health: SystemHealth,
    pub heap_bytes: u64,
    pub heap_limit_bytes: u64,
    /// Error fraction over the last hour, across all operations.
    pub recent_error_rate: f64,
    /// Mean duration over the last hour, across all operations.
    pub recent_avg_duration_ms: f64,
    pub operations: Vec<OperationReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_good_when_quiet() {
        let health = SystemHealth::classify(0.0, 100.0, 1_000, 1_000_000, 5_000);
        assert_eq!(health, SystemHealth::Good);
    }

    #[test]
    fn test_classify_fair_on_moderate_latency() {
        let health = SystemHealth::classify(0.0, 3_000.0, 1_000, 1_000_000, 5_000);
        assert_eq!(health, SystemHealth::Fair);
    }

    #[test]
    fn test_classify_warning_on_high_error_rate() {
        let health = SystemHealth::classify(0.15, 100.0, 1_000, 1_000_000, 5_000);
        assert_eq!(health, SystemHealth::Warning);
    }

    #[test]
    fn test_classify_warning_on_slow_operations() {
        let health = SystemHealth::classify(0.0, 6_000.0, 1_000, 1_000_000, 5_000);
        assert_eq!(health, SystemHealth::Warning);
    }

    #[test]
    fn test_classify_critical_on_error_storm() {
        let health = SystemHealth::classify(0.5, 100.0, 1_000, 1_000_000, 5_000);
        assert_eq!(health, SystemHealth::Critical);
    }

    #[test]
    fn test_classify_critical_on_heap_over_limit() {
        let health = SystemHealth::classify(0.0, 100.0, 2_000_000, 1_000_000, 5_000);
        assert_eq!(health, SystemHealth::Critical);
    }

    #[test]
    fn test_classify_unknown_heap_is_not_critical() {
        let health = SystemHealth::classify(0.0, 100.0, 0, 1_000_000, 5_000);
        assert_eq!(health, SystemHealth::Good);
    }
}
