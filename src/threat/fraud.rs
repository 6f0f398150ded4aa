//! Fraud subscore.
//!
//! Aggregates velocity, device novelty, time-of-day risk, and location
//! anomaly into a 0-100 subscore. All inputs come from stored history (the
//! device and activity stores); caller-supplied context flags are scored by
//! the behavioral analyzer instead, so the two never count the same signal.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::warn;

use super::ThreatContext;
use crate::geo::distance_miles;
use crate::model::Position;
use crate::stores::{ActivityRecord, ActivityStore, DeviceStore};

/// Window for velocity and location-anomaly counting.
const VELOCITY_WINDOW_MINUTES: i64 = 5;

/// Travel speed above which consecutive located actions are implausible.
const MAX_PLAUSIBLE_SPEED_MPH: f64 = 500.0;

/// Computed fraud subscore with its contributing factors.
#[derive(Debug, Clone)]
pub struct FraudAssessment {
    pub score: u32,
    pub factors: Vec<String>,
}

impl FraudAssessment {
    /// Coarse level used in the persisted fraud record.
    pub fn level(&self) -> &'static str {
        if self.score >= 50 {
            "high"
        } else if self.score >= 25 {
            "medium"
        } else {
            "low"
        }
    }
}

/// Scores `subject` from stored history.
///
/// Store failures degrade to a zero contribution for that factor; fraud
/// scoring must never fail the caller.
pub async fn assess(
    subject: &str,
    ctx: &ThreatContext,
    devices: &dyn DeviceStore,
    activities: &dyn ActivityStore,
) -> FraudAssessment {
    let mut score = 0u32;
    let mut factors = Vec::new();

    let since = Utc::now() - ChronoDuration::minutes(VELOCITY_WINDOW_MINUTES);
    match activities.recent(subject, since).await {
        Ok(recent) => {
            if recent.len() > 10 {
                score += 40;
                factors.push("high_velocity".to_string());
            } else if recent.len() > 5 {
                score += 20;
                factors.push("elevated_velocity".to_string());
            }

            let mut kinds: Vec<&str> = recent.iter().map(|r| r.action.as_str()).collect();
            kinds.sort_unstable();
            kinds.dedup();
            if kinds.len() > 8 {
                score += 30;
                factors.push("scattered_actions".to_string());
            }

            if has_implausible_travel(&recent) {
                score += 25;
                factors.push("implausible_travel".to_string());
            }
        }
        Err(err) => warn!(subject, error = %err, "activity lookup failed during fraud scoring"),
    }

    match devices.recent(subject).await {
        Ok(known) if !known.is_empty() => {
            // Novelty only means something against an existing baseline.
            if let Some(ip) = &ctx.client_ip {
                if !known.iter().any(|d| &d.ip == ip) {
                    score += 20;
                    factors.push("new_ip".to_string());
                }
            }
            if let Some(ua) = &ctx.user_agent {
                if !known.iter().any(|d| &d.user_agent == ua) {
                    score += 15;
                    factors.push("new_user_agent".to_string());
                }
            }
            if let Some(fingerprint) = &ctx.device_fingerprint {
                if !known.iter().any(|d| &d.fingerprint == fingerprint) {
                    score += 25;
                    factors.push("new_fingerprint".to_string());
                }
            }
        }
        Ok(_) => {}
        Err(err) => warn!(subject, error = %err, "device lookup failed during fraud scoring"),
    }

    if ctx.local_hour <= 5 {
        score += 10;
        factors.push("overnight_activity".to_string());
    }

    FraudAssessment {
        score: score.min(100),
        factors,
    }
}

/// Location anomaly: consecutive located actions whose implied travel speed
/// exceeds [`MAX_PLAUSIBLE_SPEED_MPH`]. Sub-second gaps count as one second
/// so a zero elapsed time cannot divide away the distance.
fn has_implausible_travel(recent: &[ActivityRecord]) -> bool {
    let mut located: Vec<(DateTime<Utc>, Position)> = recent
        .iter()
        .filter_map(|record| record.position.map(|position| (record.at, position)))
        .collect();
    located.sort_by_key(|(at, _)| *at);

    located.windows(2).any(|pair| {
        let (earlier_at, from) = pair[0];
        let (later_at, to) = pair[1];
        let hours = (later_at - earlier_at).num_seconds().max(1) as f64 / 3600.0;
        distance_miles(from.lat, from.lon, to.lat, to.lon) > MAX_PLAUSIBLE_SPEED_MPH * hours
    })
}
