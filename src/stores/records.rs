//! Schemas for every record the core persists to the audit sink.
//!
//! These are the wire shapes operators and downstream jobs read back; field
//! names are part of the persisted layout and must stay stable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic `security_logs` — one row per threat scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityLogRecord {
    pub subject: String,
    pub action: String,
    pub metadata: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Topic `security_incidents` — recorded at medium threat and above.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityIncidentRecord {
    pub subject: String,
    pub activity: String,
    pub threat_score: u32,
    pub severity: String,
    pub context: serde_json::Value,
    pub at: DateTime<Utc>,
    /// Automatic responses taken, e.g. `["notified", "suspended"]`.
    pub auto_actions: Vec<String>,
}

/// Topic `performance_alerts` — threshold breaches from the meter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceAlertRecord {
    pub alert_type: String,
    pub op: String,
    pub details: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Topic `fraud_scores` — one row per fraud subscore computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudScoreRecord {
    pub subject: String,
    pub activity: String,
    pub score: u32,
    pub factors: Vec<String>,
    pub level: String,
    pub at: DateTime<Utc>,
}

/// Topic `resource_alerts` — admission rejections and sampler breaches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAlertRecord {
    pub alert_type: String,
    pub resource: String,
    pub current: u64,
    pub limit: u64,
    pub requested: u64,
    pub at: DateTime<Utc>,
}

/// Topic `notification_logs` — one row per fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationLogRecord {
    pub recipient_id: String,
    pub role: String,
    pub title: String,
    /// Body prefix, at most 100 characters.
    pub body_prefix: String,
    pub severity: String,
    /// Channel name to "ok" or an error message.
    pub channel_results: serde_json::Value,
    pub at: DateTime<Utc>,
    pub successful: bool,
}

/// Topic `predictions` — demand and utilization projections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub prediction_type: String,
    pub payload: serde_json::Value,
    pub timeframe: String,
    pub location: Option<String>,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_log_round_trips_through_json() {
        let record = SecurityLogRecord {
            subject: "c1".into(),
            action: "dispatch_order".into(),
            metadata: serde_json::json!({"score": 12}),
            at: Utc::now(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["subject"], "c1");
        assert_eq!(value["metadata"]["score"], 12);
        let back: SecurityLogRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back.action, "dispatch_order");
    }

    #[test]
    fn test_notification_log_field_names() {
        let record = NotificationLogRecord {
            recipient_id: "d1".into(),
            role: "driver".into(),
            title: "New delivery".into(),
            body_prefix: "Pick up at".into(),
            severity: "normal".into(),
            channel_results: serde_json::json!({"push": "ok"}),
            at: Utc::now(),
            successful: true,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["recipient_id"], "d1");
        assert_eq!(value["body_prefix"], "Pick up at");
        assert_eq!(value["successful"], true);
    }
}
