//! Weighted multi-factor driver matcher.
//!
//! Ranking is pure relative to a [`MatchContext`] snapshot: performance
//! aggregates and customer preferences are loaded before ranking begins, so
//! scoring the same inputs always produces the same order. Ties keep the
//! input order.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::geo::distance_miles;
use crate::model::{CustomerPrefs, Driver, Order, PerformanceWindow};

// =============================================================================
// Factor weights
// =============================================================================

const WEIGHT_DISTANCE: f64 = 0.30;
const WEIGHT_PERFORMANCE: f64 = 0.25;
const WEIGHT_AVAILABILITY: f64 = 0.20;
const WEIGHT_PREFERENCE: f64 = 0.15;
const WEIGHT_REALTIME: f64 = 0.10;

/// Distance within which a driver scores full marks, in miles.
const FULL_SCORE_DISTANCE_MILES: f64 = 5.0;

/// Score lost per active assignment.
const ASSIGNMENT_PENALTY: f64 = 30.0;

/// Weather conditions the realtime factor reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Weather {
    Clear,
    Cloudy,
    Rain,
    Snow,
}

/// Traffic conditions the realtime factor reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Traffic {
    Light,
    Moderate,
    Heavy,
}

/// Snapshot of everything ranking needs beyond the candidates themselves.
#[derive(Debug, Clone)]
pub struct MatchContext {
    /// 30-day aggregates keyed by driver id.
    pub performance: HashMap<String, PerformanceWindow>,
    /// The ordering customer's driver preferences.
    pub prefs: CustomerPrefs,
    pub weather: Weather,
    pub traffic: Traffic,
    /// Local hour of day, 0-23.
    pub local_hour: u32,
    /// Heartbeat age beyond which availability starts decaying.
    pub heartbeat_grace: Duration,
}

impl MatchContext {
    pub fn new(weather: Weather, traffic: Traffic, local_hour: u32) -> Self {
        Self {
            performance: HashMap::new(),
            prefs: CustomerPrefs::default(),
            weather,
            traffic,
            local_hour,
            heartbeat_grace: Duration::from_secs(300),
        }
    }
}

/// A candidate with its computed match score.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub driver: Driver,
    pub score: f64,
}

/// Ranks `candidates` for `order`, best first.
///
/// Starts from a base of 100 and blends each factor in fixed order with
/// `score = score * (1 - w) + sub * w`. The final score is rounded to two
/// decimals; equal scores preserve input order.
pub fn rank(order: &Order, candidates: Vec<Driver>, ctx: &MatchContext) -> Vec<ScoredCandidate> {
    let now = Instant::now();
    let mut scored: Vec<ScoredCandidate> = candidates
        .into_iter()
        .map(|driver| {
            let score = score_driver(order, &driver, ctx, now);
            ScoredCandidate { driver, score }
        })
        .collect();

    // Stable sort: ties keep input order.
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).expect("score is never NaN"));
    scored
}

fn score_driver(order: &Order, driver: &Driver, ctx: &MatchContext, now: Instant) -> f64 {
    let mut score = 100.0;

    let factors = [
        (distance_score(order, driver), WEIGHT_DISTANCE),
        (performance_score(driver, ctx), WEIGHT_PERFORMANCE),
        (availability_score(driver, ctx, now), WEIGHT_AVAILABILITY),
        (preference_score(order, driver, ctx), WEIGHT_PREFERENCE),
        (realtime_score(ctx), WEIGHT_REALTIME),
    ];
    for (sub, weight) in factors {
        score = score * (1.0 - weight) + sub * weight;
    }

    (score * 100.0).round() / 100.0
}

/// Full marks within 5 miles, then 10 points lost per mile.
/// A driver without a location scores a neutral 50.
fn distance_score(order: &Order, driver: &Driver) -> f64 {
    let Some(position) = driver.position else {
        return 50.0;
    };
    let miles = distance_miles(
        position.lat,
        position.lon,
        order.vendor_position.lat,
        order.vendor_position.lon,
    );
    if miles <= FULL_SCORE_DISTANCE_MILES {
        100.0
    } else {
        (100.0 - 10.0 * (miles - FULL_SCORE_DISTANCE_MILES)).max(0.0)
    }
}

/// 30-day window blend: success rate 40%, rating 30%, delivery speed 30%.
///
/// A driver with no delivery history scores a neutral 75. Partial data
/// falls back to rating 4.5 and 30-minute deliveries.
fn performance_score(driver: &Driver, ctx: &MatchContext) -> f64 {
    let Some(window) = ctx.performance.get(&driver.id) else {
        return 75.0;
    };
    let Some(success_rate) = window.success_rate() else {
        return 75.0;
    };

    let rating = window.avg_rating().unwrap_or(4.5);
    let avg_minutes = window.avg_delivery_minutes().unwrap_or(30.0);

    let speed = (100.0 - 2.0 * (avg_minutes - 20.0)).max(0.0);
    let blended = success_rate * 100.0 * 0.4 + (rating / 5.0) * 100.0 * 0.3 + speed * 0.3;
    blended.clamp(0.0, 100.0)
}

/// Load and recency: 30 points per active assignment, then 5 points per
/// minute of heartbeat age past the grace window. Inactive drivers score 0.
fn availability_score(driver: &Driver, ctx: &MatchContext, now: Instant) -> f64 {
    if !driver.active {
        return 0.0;
    }

    let load_penalty = (ASSIGNMENT_PENALTY * driver.active_assignments as f64).min(100.0);
    let mut score = 100.0 - load_penalty;

    let age_minutes = now.duration_since(driver.last_heartbeat).as_secs_f64() / 60.0;
    let grace_minutes = ctx.heartbeat_grace.as_secs_f64() / 60.0;
    if age_minutes > grace_minutes {
        score -= 5.0 * (age_minutes - grace_minutes);
    }

    score.max(0.0)
}

fn preference_score(order: &Order, driver: &Driver, ctx: &MatchContext) -> f64 {
    if ctx.prefs.preferred.contains(&driver.id) {
        return 100.0;
    }
    if ctx.prefs.blocked.contains(&driver.id) {
        return 0.0;
    }
    if driver.preferred_vendors.contains(&order.vendor_id) {
        return 90.0;
    }
    80.0
}

/// Conditions at dispatch time: bad weather and heavy traffic penalize,
/// rush hours (11-14, 17-21 local) reward.
fn realtime_score(ctx: &MatchContext) -> f64 {
    let mut score: f64 = 100.0;
    if matches!(ctx.weather, Weather::Rain | Weather::Snow) {
        score -= 10.0;
    }
    if ctx.traffic == Traffic::Heavy {
        score -= 15.0;
    }
    if (11..=14).contains(&ctx.local_hour) || (17..=21).contains(&ctx.local_hour) {
        score += 10.0;
    }
    score.clamp(0.0, 100.0)
}
