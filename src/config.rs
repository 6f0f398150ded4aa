//! Configuration for the dispatch core.
//!
//! Every tunable the core reads is enumerated here with its default.
//! Components receive their sub-config by value at construction; nothing
//! reads configuration ambiently after startup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// =============================================================================
// Defaults
// =============================================================================

/// Operation duration above which a performance alert fires (5 s).
pub const DEFAULT_RESPONSE_TIME_ALERT_MS: u64 = 5_000;

/// Heap delta above which a performance alert fires (128 MiB).
pub const DEFAULT_MEMORY_ALERT_BYTES: u64 = 134_217_728;

/// Base TTL handed to the adaptive cache (minutes).
pub const DEFAULT_CACHE_BASE_MINUTES: u64 = 5;

/// Spatial grid cell size in degrees.
pub const DEFAULT_SPATIAL_GRID_DEGREES: f64 = 0.01;

/// Maximum heartbeat age for a driver to stay indexable (minutes).
pub const DEFAULT_DRIVER_LIVENESS_MINUTES: u64 = 10;

/// Heartbeat age at which the availability sub-score starts decaying (minutes).
pub const DEFAULT_AVAILABILITY_HEARTBEAT_MINUTES: u64 = 5;

/// Concurrent dispatch admission limit.
pub const DEFAULT_ACTIVE_DISPATCH_LIMIT: u64 = 100;

/// Heap admission limit (512 MiB).
pub const DEFAULT_HEAP_BYTES_LIMIT: u64 = 536_870_912;

/// CPU utilization admission limit (percent).
pub const DEFAULT_CPU_PCT_LIMIT: u64 = 80;

/// Database connection admission limit.
pub const DEFAULT_DB_CONNS_LIMIT: u64 = 50;

/// Radius of the candidate search around the vendor, in miles.
pub const DEFAULT_DISPATCH_RADIUS_MILES: f64 = 10.0;

// =============================================================================
// Sub-configs
// =============================================================================

/// Limits for the resource admission gauges.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub active_dispatch: u64,
    pub heap_bytes: u64,
    pub cpu_pct: u64,
    pub db_conns: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            active_dispatch: DEFAULT_ACTIVE_DISPATCH_LIMIT,
            heap_bytes: DEFAULT_HEAP_BYTES_LIMIT,
            cpu_pct: DEFAULT_CPU_PCT_LIMIT,
            db_conns: DEFAULT_DB_CONNS_LIMIT,
        }
    }
}

/// Configuration for the circuit breaker and its retry wrapper.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures in CLOSED before the circuit opens.
    pub max_failures: u32,
    /// How long an open circuit rejects before allowing a half-open trial.
    pub reset_timeout: Duration,
    /// Attempt budget for the retry wrapper.
    pub retries: u32,
    /// Linear backoff unit: sleep `base_delay * attempt` between attempts.
    pub base_delay: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
            retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Configuration for the background job scheduler.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Maximum jobs running at once.
    pub max_concurrent_jobs: usize,
    /// Tick loop interval.
    pub tick: Duration,
    /// Backoff unit after a failed run: `retry_count * retry_backoff`.
    pub retry_backoff: Duration,
    /// Backoff unit after a timed-out run: `retry_count * timeout_backoff`.
    pub timeout_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            tick: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(30),
            timeout_backoff: Duration::from_secs(60),
        }
    }
}

/// Threat score thresholds that trigger graded responses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThreatThresholds {
    /// Counted as a low threat.
    pub low: u32,
    /// MEDIUM incident + urgent notification.
    pub medium: u32,
    /// HIGH incident + critical notification, subject marked high-threat.
    pub high: u32,
    /// Subject additionally suspended.
    pub suspend: u32,
}

impl Default for ThreatThresholds {
    fn default() -> Self {
        Self {
            low: 30,
            medium: 50,
            high: 75,
            suspend: 95,
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Top-level settings for the dispatch core.
#[derive(Debug, Clone)]
pub struct Settings {
    pub response_time_alert_ms: u64,
    pub memory_alert_bytes: u64,
    pub cache_base_minutes: u64,
    pub spatial_grid_degrees: f64,
    pub dispatch_radius_miles: f64,
    pub driver_liveness: Duration,
    pub availability_heartbeat: Duration,
    pub resource_limits: ResourceLimits,
    pub circuit: BreakerConfig,
    pub scheduler: SchedulerConfig,
    pub threat: ThreatThresholds,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            response_time_alert_ms: DEFAULT_RESPONSE_TIME_ALERT_MS,
            memory_alert_bytes: DEFAULT_MEMORY_ALERT_BYTES,
            cache_base_minutes: DEFAULT_CACHE_BASE_MINUTES,
            spatial_grid_degrees: DEFAULT_SPATIAL_GRID_DEGREES,
            dispatch_radius_miles: DEFAULT_DISPATCH_RADIUS_MILES,
            driver_liveness: Duration::from_secs(DEFAULT_DRIVER_LIVENESS_MINUTES * 60),
            availability_heartbeat: Duration::from_secs(
                DEFAULT_AVAILABILITY_HEARTBEAT_MINUTES * 60,
            ),
            resource_limits: ResourceLimits::default(),
            circuit: BreakerConfig::default(),
            scheduler: SchedulerConfig::default(),
            threat: ThreatThresholds::default(),
        }
    }
}
