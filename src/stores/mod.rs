//! Collaborator interfaces and persisted record schemas.
//!
//! Everything outside the core — the driver population source, rollup
//! stores, device and activity history, IP reputation, and the append-only
//! audit log — is reached through the thin async traits here. The core never
//! sees a database; tests and embedders plug in the [`memory`]
//! implementations or their own.

pub mod memory;
mod records;

pub use records::{
    FraudScoreRecord, NotificationLogRecord, PerformanceAlertRecord, PredictionRecord,
    ResourceAlertRecord, SecurityIncidentRecord, SecurityLogRecord,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::model::{CustomerPrefs, Driver, Order, PerformanceWindow, Position};
use crate::notify::Recipient;

/// Source of dispatchable driver records.
#[async_trait]
pub trait DriverSource: Send + Sync {
    /// Driver records eligible for the given order, with position, active
    /// flag, heartbeat, assignment count, and vendor preferences populated.
    async fn list_candidates(&self, order: &Order) -> Result<Vec<Driver>, DispatchError>;
}

/// 30-day driver performance rollups.
#[async_trait]
pub trait PerformanceStore: Send + Sync {
    async fn fetch_window(
        &self,
        driver_id: &str,
        since: DateTime<Utc>,
    ) -> Result<PerformanceWindow, DispatchError>;
}

/// Customer driver preferences.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn customer(&self, customer_id: &str) -> Result<CustomerPrefs, DispatchError>;
}

/// A device seen for a subject, used for novelty checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub ip: String,
    pub user_agent: String,
    pub fingerprint: String,
    pub last_seen: DateTime<Utc>,
}

/// Recently seen devices per subject.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn recent(&self, subject: &str) -> Result<Vec<DeviceRecord>, DispatchError>;
}

/// One recorded action for a subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub action: String,
    pub at: DateTime<Utc>,
    /// Where the action originated, when the surface captured it.
    pub position: Option<Position>,
}

/// Recent activity per subject, newest-first not required.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn recent(
        &self,
        subject: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActivityRecord>, DispatchError>;
}

/// External IP blacklist lookups.
#[async_trait]
pub trait IpReputation: Send + Sync {
    async fn is_blacklisted(&self, ip: &str) -> Result<bool, DispatchError>;
}

/// Resolves a subject id to a notification recipient with its addresses.
///
/// Channel addressing lives with the notification surface outside the core;
/// this trait is the thin seam to it.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn recipient_for(&self, subject: &str) -> Result<Recipient, DispatchError>;
}

/// Topics in the append-only audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditTopic {
    SecurityLogs,
    SecurityIncidents,
    PerformanceAlerts,
    PerformanceReports,
    FraudScores,
    ResourceAlerts,
    NotificationLogs,
    Predictions,
}

impl AuditTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SecurityLogs => "security_logs",
            Self::SecurityIncidents => "security_incidents",
            Self::PerformanceAlerts => "performance_alerts",
            Self::PerformanceReports => "performance_reports",
            Self::FraudScores => "fraud_scores",
            Self::ResourceAlerts => "resource_alerts",
            Self::NotificationLogs => "notification_logs",
            Self::Predictions => "predictions",
        }
    }
}

/// Append-only audit log.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(
        &self,
        topic: AuditTopic,
        record: serde_json::Value,
    ) -> Result<(), DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_topic_names() {
        assert_eq!(AuditTopic::SecurityLogs.as_str(), "security_logs");
        assert_eq!(AuditTopic::FraudScores.as_str(), "fraud_scores");
        assert_eq!(AuditTopic::NotificationLogs.as_str(), "notification_logs");
        assert_eq!(AuditTopic::Predictions.as_str(), "predictions");
    }
}
