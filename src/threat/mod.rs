//! Threat-aware activity scoring.
//!
//! Every scored activity lands in a bounded per-subject window, then four
//! analyses add up: session signals from the caller's context, network
//! reputation, temporal patterns over the window, and behavioral signals
//! including the stored-history [`fraud`] subscore. The total is clamped to
//! 100 and drives graded responses: audit-only, incident records, operator
//! notification, and suspension.
//!
//! The fraud score is a heuristic signal, not an authorization control.

pub mod fraud;

pub use fraud::FraudAssessment;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ThreatThresholds;
use crate::notify::{Channel, Message, Notifier, Recipient, Severity};
use crate::stores::{
    ActivityStore, AuditSink, AuditTopic, DeviceStore, FraudScoreRecord, IpReputation,
    SecurityIncidentRecord, SecurityLogRecord,
};

/// Activity entries kept per subject.
pub const WINDOW_MAX: usize = 200;

/// Entries kept after an overflowing window is trimmed.
pub const WINDOW_TRIM: usize = 100;

/// Window for rapid-action detection.
const RAPID_WINDOW: Duration = Duration::from_secs(60);

/// Identical activities within the rapid window that count as rapid.
const RAPID_IDENTICAL: usize = 5;

/// Total activities within the rapid window that count as rapid.
const RAPID_TOTAL: usize = 15;

/// Caller-supplied signals about the current request.
///
/// A fixed set of optional typed fields; the scoring never introspects
/// arbitrary keys.
#[derive(Debug, Clone)]
pub struct ThreatContext {
    pub multiple_devices: bool,
    pub rapid_location_changes: bool,
    pub unusual_user_agent: bool,
    pub excessive_failed_logins: bool,
    pub vpn_detected: bool,
    pub tor_detected: bool,
    pub automated_behavior_detected: bool,
    pub unusual_transaction_pattern: bool,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub device_fingerprint: Option<String>,
    /// Local hour of day, 0-23.
    pub local_hour: u32,
}

impl Default for ThreatContext {
    fn default() -> Self {
        Self {
            multiple_devices: false,
            rapid_location_changes: false,
            unusual_user_agent: false,
            excessive_failed_logins: false,
            vpn_detected: false,
            tor_detected: false,
            automated_behavior_detected: false,
            unusual_transaction_pattern: false,
            client_ip: None,
            user_agent: None,
            device_fingerprint: None,
            local_hour: 12,
        }
    }
}

/// Graded threat levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
}

/// Result of one scoring pass.
#[derive(Debug, Clone)]
pub struct ThreatAssessment {
    pub subject: String,
    pub activity: String,
    pub score: u32,
    pub level: ThreatLevel,
    pub suspended: bool,
    pub factors: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct SubjectStatus {
    high_threat: bool,
    suspended: bool,
}

/// Operator snapshot of the threat meter.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ThreatMetrics {
    pub subjects_tracked: usize,
    pub high_threat_subjects: usize,
    pub suspended_subjects: usize,
    pub low_threats: u64,
    pub incidents: u64,
}

/// Rolling activity scorer with threshold actions.
pub struct ThreatMeter {
    thresholds: ThreatThresholds,
    windows: DashMap<String, VecDeque<(String, Instant)>>,
    suspicious_ips: RwLock<HashSet<String>>,
    status: DashMap<String, SubjectStatus>,
    low_threats: AtomicU64,
    incidents: AtomicU64,
    devices: Arc<dyn DeviceStore>,
    activities: Arc<dyn ActivityStore>,
    reputation: Arc<dyn IpReputation>,
    sink: Arc<dyn AuditSink>,
    notifier: Arc<Notifier>,
    ops_recipient: Recipient,
}

impl ThreatMeter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        thresholds: ThreatThresholds,
        devices: Arc<dyn DeviceStore>,
        activities: Arc<dyn ActivityStore>,
        reputation: Arc<dyn IpReputation>,
        sink: Arc<dyn AuditSink>,
        notifier: Arc<Notifier>,
        ops_recipient: Recipient,
    ) -> Self {
        Self {
            thresholds,
            windows: DashMap::new(),
            suspicious_ips: RwLock::new(HashSet::new()),
            status: DashMap::new(),
            low_threats: AtomicU64::new(0),
            incidents: AtomicU64::new(0),
            devices,
            activities,
            reputation,
            sink,
            notifier,
            ops_recipient,
        }
    }

    /// Adds an IP to the local suspicious set.
    pub fn add_suspicious_ip(&self, ip: impl Into<String>) {
        self.suspicious_ips
            .write()
            .expect("suspicious ip lock poisoned")
            .insert(ip.into());
    }

    /// Whether a prior scoring pass suspended this subject.
    pub fn is_suspended(&self, subject: &str) -> bool {
        self.status
            .get(subject)
            .map(|status| status.suspended)
            .unwrap_or(false)
    }

    /// Scores one activity for `subject` and applies threshold actions.
    ///
    /// Never fails: collaborator errors degrade the affected analysis to a
    /// zero contribution and are logged.
    pub async fn score(
        &self,
        subject: &str,
        activity: &str,
        ctx: &ThreatContext,
    ) -> ThreatAssessment {
        self.record_activity(subject, activity);

        let mut score = 0u32;
        let mut factors = Vec::new();

        let (session, mut session_factors) = session_analysis(ctx);
        score += session;
        factors.append(&mut session_factors);

        let (network, mut network_factors) = self.network_analysis(ctx).await;
        score += network;
        factors.append(&mut network_factors);

        let (temporal, mut temporal_factors) = self.temporal_analysis(subject, activity, ctx);
        score += temporal;
        factors.append(&mut temporal_factors);

        let (behavioral, mut behavioral_factors) = self.behavioral_analysis(subject, ctx).await;
        score += behavioral;
        factors.append(&mut behavioral_factors);

        let score = score.min(100);
        let assessment = self
            .apply_thresholds(subject, activity, score, factors, ctx)
            .await;

        self.persist_audit(&assessment).await;
        assessment
    }

    fn record_activity(&self, subject: &str, activity: &str) {
        let mut window = self.windows.entry(subject.to_string()).or_default();
        window.push_back((activity.to_string(), Instant::now()));
        if window.len() > WINDOW_MAX {
            let drop = window.len() - WINDOW_TRIM;
            window.drain(..drop);
        }
    }

    async fn network_analysis(&self, ctx: &ThreatContext) -> (u32, Vec<String>) {
        let mut score = 0;
        let mut factors = Vec::new();

        if let Some(ip) = &ctx.client_ip {
            let locally_suspicious = self
                .suspicious_ips
                .read()
                .expect("suspicious ip lock poisoned")
                .contains(ip);
            if locally_suspicious {
                score += 40;
                factors.push("suspicious_ip".to_string());
            }

            match self.reputation.is_blacklisted(ip).await {
                Ok(true) => {
                    score += 60;
                    factors.push("blacklisted_ip".to_string());
                }
                Ok(false) => {}
                Err(err) => warn!(%ip, error = %err, "ip reputation lookup failed"),
            }
        }
        if ctx.vpn_detected {
            score += 10;
            factors.push("vpn".to_string());
        }
        if ctx.tor_detected {
            score += 35;
            factors.push("tor".to_string());
        }

        (score, factors)
    }

    fn temporal_analysis(&self, subject: &str, activity: &str, ctx: &ThreatContext) -> (u32, Vec<String>) {
        let mut score = 0;
        let mut factors = Vec::new();

        if ctx.local_hour <= 5 {
            score += 15;
            factors.push("overnight".to_string());
        }

        if let Some(window) = self.windows.get(subject) {
            let now = Instant::now();
            let mut identical = 0usize;
            let mut total = 0usize;
            for (tag, at) in window.iter() {
                if now.duration_since(*at) <= RAPID_WINDOW {
                    total += 1;
                    if tag == activity {
                        identical += 1;
                    }
                }
            }
            if identical > RAPID_IDENTICAL || total > RAPID_TOTAL {
                score += 25;
                factors.push("rapid_actions".to_string());
            }
        }

        (score, factors)
    }

    async fn behavioral_analysis(&self, subject: &str, ctx: &ThreatContext) -> (u32, Vec<String>) {
        let mut score = 0u32;
        let mut factors = Vec::new();

        if ctx.automated_behavior_detected {
            score += 40;
            factors.push("automated_behavior".to_string());
        }
        if ctx.unusual_transaction_pattern {
            score += 30;
            factors.push("unusual_transactions".to_string());
        }

        let fraud = fraud::assess(subject, ctx, self.devices.as_ref(), self.activities.as_ref()).await;
        self.persist_fraud(subject, &fraud).await;
        score += (fraud.score as f64 * 0.8).round() as u32;
        factors.extend(fraud.factors);

        (score, factors)
    }

    async fn apply_thresholds(
        &self,
        subject: &str,
        activity: &str,
        score: u32,
        factors: Vec<String>,
        ctx: &ThreatContext,
    ) -> ThreatAssessment {
        let mut suspended = self.is_suspended(subject);
        let level = if score >= self.thresholds.high {
            let mut auto_actions = vec!["notified".to_string()];
            let mut status = self.status.entry(subject.to_string()).or_default();
            status.high_threat = true;
            if score >= self.thresholds.suspend {
                status.suspended = true;
                suspended = true;
                auto_actions.push("suspended".to_string());
            }
            drop(status);

            info!(subject, score, "high threat detected");
            self.record_incident(subject, activity, score, "HIGH", &auto_actions, ctx)
                .await;
            self.notify_ops(subject, activity, score, Severity::Critical).await;
            ThreatLevel::High
        } else if score >= self.thresholds.medium {
            self.record_incident(subject, activity, score, "MEDIUM", &["notified".to_string()], ctx)
                .await;
            self.notify_ops(subject, activity, score, Severity::Urgent).await;
            ThreatLevel::Medium
        } else if score >= self.thresholds.low {
            self.low_threats.fetch_add(1, Ordering::Relaxed);
            ThreatLevel::Low
        } else {
            ThreatLevel::None
        };

        ThreatAssessment {
            subject: subject.to_string(),
            activity: activity.to_string(),
            score,
            level,
            suspended,
            factors,
        }
    }

    async fn record_incident(
        &self,
        subject: &str,
        activity: &str,
        score: u32,
        severity: &str,
        auto_actions: &[String],
        ctx: &ThreatContext,
    ) {
        self.incidents.fetch_add(1, Ordering::Relaxed);
        let record = SecurityIncidentRecord {
            subject: subject.to_string(),
            activity: activity.to_string(),
            threat_score: score,
            severity: severity.to_string(),
            context: serde_json::json!({
                "client_ip": ctx.client_ip,
                "user_agent": ctx.user_agent,
                "local_hour": ctx.local_hour,
            }),
            at: Utc::now(),
            auto_actions: auto_actions.to_vec(),
        };
        self.append(AuditTopic::SecurityIncidents, &record).await;
    }

    async fn notify_ops(&self, subject: &str, activity: &str, score: u32, severity: Severity) {
        let message = Message::new(
            format!("Threat {} on {subject}", severity.as_str()),
            format!("activity {activity} scored {score}"),
        );
        self.notifier
            .send(
                &self.ops_recipient,
                &message,
                severity,
                &[Channel::Email, Channel::Chat],
            )
            .await;
    }

    async fn persist_fraud(&self, subject: &str, fraud: &FraudAssessment) {
        let record = FraudScoreRecord {
            subject: subject.to_string(),
            activity: "fraud_assessment".to_string(),
            score: fraud.score,
            factors: fraud.factors.clone(),
            level: fraud.level().to_string(),
            at: Utc::now(),
        };
        self.append(AuditTopic::FraudScores, &record).await;
    }

    async fn persist_audit(&self, assessment: &ThreatAssessment) {
        let record = SecurityLogRecord {
            subject: assessment.subject.clone(),
            action: assessment.activity.clone(),
            metadata: serde_json::json!({
                "score": assessment.score,
                "level": assessment.level,
                "factors": assessment.factors,
            }),
            at: Utc::now(),
        };
        self.append(AuditTopic::SecurityLogs, &record).await;
    }

    async fn append<R: Serialize>(&self, topic: AuditTopic, record: &R) {
        match serde_json::to_value(record) {
            Ok(value) => {
                if let Err(err) = self.sink.append(topic, value).await {
                    warn!(topic = topic.as_str(), error = %err, "audit append failed");
                }
            }
            Err(err) => warn!(topic = topic.as_str(), error = %err, "audit serialization failed"),
        }
    }

    pub fn metrics(&self) -> ThreatMetrics {
        let high_threat_subjects = self.status.iter().filter(|s| s.high_threat).count();
        let suspended_subjects = self.status.iter().filter(|s| s.suspended).count();
        ThreatMetrics {
            subjects_tracked: self.windows.len(),
            high_threat_subjects,
            suspended_subjects,
            low_threats: self.low_threats.load(Ordering::Relaxed),
            incidents: self.incidents.load(Ordering::Relaxed),
        }
    }

    /// Drops all windows and statuses. Used by emergency cleanup.
    pub fn clear(&self) {
        self.windows.clear();
        self.status.clear();
    }
}

/// Session analysis over caller-supplied flags.
fn session_analysis(ctx: &ThreatContext) -> (u32, Vec<String>) {
    let mut score = 0;
    let mut factors = Vec::new();

    if ctx.multiple_devices {
        score += 20;
        factors.push("multiple_devices".to_string());
    }
    if ctx.rapid_location_changes {
        score += 30;
        factors.push("rapid_location_changes".to_string());
    }
    if ctx.unusual_user_agent {
        score += 15;
        factors.push("unusual_user_agent".to_string());
    }
    if ctx.excessive_failed_logins {
        score += 25;
        factors.push("failed_logins".to_string());
    }

    (score, factors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::{
        MemoryActivityStore, MemoryAuditSink, MemoryDeviceStore, MemoryIpReputation,
    };

    struct Fixture {
        meter: ThreatMeter,
        sink: Arc<MemoryAuditSink>,
        reputation: Arc<MemoryIpReputation>,
    }

    fn fixture() -> Fixture {
        let sink = Arc::new(MemoryAuditSink::new());
        let reputation = Arc::new(MemoryIpReputation::new());
        let notifier = Arc::new(Notifier::new(sink.clone()));
        let meter = ThreatMeter::new(
            ThreatThresholds::default(),
            Arc::new(MemoryDeviceStore::new()),
            Arc::new(MemoryActivityStore::new()),
            reputation.clone(),
            sink.clone(),
            notifier,
            Recipient::bare("ops", crate::notify::Role::Admin),
        );
        Fixture {
            meter,
            sink,
            reputation,
        }
    }

    #[tokio::test]
    async fn test_clean_activity_scores_zero() {
        let f = fixture();
        let assessment = f.meter.score("s", "dispatch_order", &ThreatContext::default()).await;
        assert_eq!(assessment.score, 0);
        assert_eq!(assessment.level, ThreatLevel::None);
        assert!(!assessment.suspended);
        // Every scoring persists an audit record.
        assert_eq!(f.sink.records(AuditTopic::SecurityLogs).len(), 1);
    }

    #[tokio::test]
    async fn test_rapid_identical_actions_with_suspicious_ip_is_medium() {
        let f = fixture();
        f.meter.add_suspicious_ip("203.0.113.5");
        let mut ctx = ThreatContext::default();
        ctx.client_ip = Some("203.0.113.5".into());

        let mut last = None;
        for _ in 0..6 {
            last = Some(f.meter.score("s", "dispatch_order", &ctx).await);
        }
        let assessment = last.unwrap();

        // Rapid pattern (+25) plus locally suspicious IP (+40).
        assert!(assessment.score >= 65, "score {}", assessment.score);
        assert_eq!(assessment.level, ThreatLevel::Medium);
        assert!(assessment.factors.contains(&"rapid_actions".to_string()));

        let incidents = f.sink.records(AuditTopic::SecurityIncidents);
        assert!(!incidents.is_empty());
        assert_eq!(incidents.last().unwrap()["severity"], "MEDIUM");
    }

    #[tokio::test]
    async fn test_blacklisted_ip_contributes_sixty() {
        let f = fixture();
        f.reputation.blacklist("198.51.100.9");
        let mut ctx = ThreatContext::default();
        ctx.client_ip = Some("198.51.100.9".into());

        let assessment = f.meter.score("s", "login", &ctx).await;
        assert_eq!(assessment.score, 60);
        assert_eq!(assessment.level, ThreatLevel::Medium);
        assert!(assessment.factors.contains(&"blacklisted_ip".to_string()));
    }

    #[tokio::test]
    async fn test_high_threat_marks_subject() {
        let f = fixture();
        let mut ctx = ThreatContext::default();
        ctx.automated_behavior_detected = true;
        ctx.unusual_transaction_pattern = true;
        ctx.multiple_devices = true;

        // 40 + 30 + 20 = 90: high, not yet suspended.
        let assessment = f.meter.score("s", "checkout", &ctx).await;
        assert_eq!(assessment.score, 90);
        assert_eq!(assessment.level, ThreatLevel::High);
        assert!(!assessment.suspended);
        assert_eq!(f.meter.metrics().high_threat_subjects, 1);

        let incidents = f.sink.records(AuditTopic::SecurityIncidents);
        assert_eq!(incidents.last().unwrap()["severity"], "HIGH");
    }

    #[tokio::test]
    async fn test_extreme_score_suspends() {
        let f = fixture();
        let mut ctx = ThreatContext::default();
        ctx.automated_behavior_detected = true;
        ctx.unusual_transaction_pattern = true;
        ctx.tor_detected = true;

        // 40 + 30 + 35 = 105, clamped to 100: suspended.
        let assessment = f.meter.score("s", "checkout", &ctx).await;
        assert_eq!(assessment.score, 100);
        assert!(assessment.suspended);
        assert!(f.meter.is_suspended("s"));

        let incidents = f.sink.records(AuditTopic::SecurityIncidents);
        let actions = incidents.last().unwrap()["auto_actions"].as_array().unwrap();
        assert!(actions.iter().any(|a| a == "suspended"));
    }

    #[tokio::test]
    async fn test_low_threat_counted_without_incident() {
        let f = fixture();
        let mut ctx = ThreatContext::default();
        ctx.excessive_failed_logins = true;
        ctx.vpn_detected = true;

        // 25 + 10 = 35: low.
        let assessment = f.meter.score("s", "login", &ctx).await;
        assert_eq!(assessment.level, ThreatLevel::Low);
        assert_eq!(f.meter.metrics().low_threats, 1);
        assert!(f.sink.records(AuditTopic::SecurityIncidents).is_empty());
    }

    #[tokio::test]
    async fn test_overnight_hours_add_temporal_score() {
        let f = fixture();
        let mut ctx = ThreatContext::default();
        ctx.local_hour = 2;

        let assessment = f.meter.score("s", "login", &ctx).await;
        // Temporal +15 plus the fraud overnight factor 0.8 * 10 = 8.
        assert_eq!(assessment.score, 23);
    }

    #[tokio::test]
    async fn test_window_trims_on_overflow() {
        let f = fixture();
        for _ in 0..(WINDOW_MAX + 1) {
            f.meter.record_activity("s", "ping");
        }
        assert_eq!(f.meter.windows.get("s").unwrap().len(), WINDOW_TRIM);
    }

    #[tokio::test]
    async fn test_fraud_record_persisted_each_scoring() {
        let f = fixture();
        f.meter.score("s", "login", &ThreatContext::default()).await;
        assert_eq!(f.sink.records(AuditTopic::FraudScores).len(), 1);
    }

    #[tokio::test]
    async fn test_clear_resets_state() {
        let f = fixture();
        f.meter.score("s", "login", &ThreatContext::default()).await;
        f.meter.clear();
        assert_eq!(f.meter.metrics().subjects_tracked, 0);
    }
}
