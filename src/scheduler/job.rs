//! Job model for the background scheduler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::Serialize;

use crate::error::DispatchError;

/// The future a job run produces.
pub type JobFuture = BoxFuture<'static, Result<(), DispatchError>>;

/// A job body: invoked once per run.
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Scheduling priority. Within one tick, higher runs before lower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    High,
    Normal,
    Low,
}

/// The closed set of periodic intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    Second,
    FiveSeconds,
    TenSeconds,
    ThirtySeconds,
    Minute,
    FiveMinutes,
    TenMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    Hour,
    Day,
}

impl Interval {
    pub fn duration(&self) -> Duration {
        match self {
            Self::Second => Duration::from_secs(1),
            Self::FiveSeconds => Duration::from_secs(5),
            Self::TenSeconds => Duration::from_secs(10),
            Self::ThirtySeconds => Duration::from_secs(30),
            Self::Minute => Duration::from_secs(60),
            Self::FiveMinutes => Duration::from_secs(5 * 60),
            Self::TenMinutes => Duration::from_secs(10 * 60),
            Self::FifteenMinutes => Duration::from_secs(15 * 60),
            Self::ThirtyMinutes => Duration::from_secs(30 * 60),
            Self::Hour => Duration::from_secs(60 * 60),
            Self::Day => Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Parses an interval token such as `"5m"` or `"hour"`.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "second" => Some(Self::Second),
            "5s" => Some(Self::FiveSeconds),
            "10s" => Some(Self::TenSeconds),
            "30s" => Some(Self::ThirtySeconds),
            "minute" => Some(Self::Minute),
            "5m" => Some(Self::FiveMinutes),
            "10m" => Some(Self::TenMinutes),
            "15m" => Some(Self::FifteenMinutes),
            "30m" => Some(Self::ThirtyMinutes),
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            _ => None,
        }
    }
}

/// When a job runs: once at an instant, or repeatedly at an interval.
#[derive(Debug, Clone, Copy)]
pub enum Trigger {
    At(Instant),
    Every(Interval),
}

impl Trigger {
    /// The first run instant for this trigger, from `now`.
    pub fn first_run(&self, now: Instant) -> Instant {
        match self {
            Self::At(at) => *at,
            Self::Every(interval) => now + interval.duration(),
        }
    }
}

/// Per-job options.
#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    pub priority: JobPriority,
    pub max_retries: u32,
    pub timeout: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: JobPriority::Normal,
            max_retries: 3,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Timeout,
}

/// One scheduled job and its runtime state.
pub(super) struct Job {
    pub run: JobFn,
    pub trigger: Trigger,
    pub opts: JobOptions,
    pub status: JobStatus,
    pub retry_count: u32,
    pub next_run: Instant,
    pub last_error: Option<String>,
}

/// Operator snapshot of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub retry_count: u32,
    /// Milliseconds until the next run; 0 when already due.
    pub next_run_in_ms: u64,
    pub periodic: bool,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_durations() {
        assert_eq!(Interval::Second.duration(), Duration::from_secs(1));
        assert_eq!(Interval::FiveMinutes.duration(), Duration::from_secs(300));
        assert_eq!(Interval::Day.duration(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_interval_token_parsing() {
        assert_eq!(Interval::from_token("second"), Some(Interval::Second));
        assert_eq!(Interval::from_token("30s"), Some(Interval::ThirtySeconds));
        assert_eq!(Interval::from_token("30m"), Some(Interval::ThirtyMinutes));
        assert_eq!(Interval::from_token("hour"), Some(Interval::Hour));
        assert_eq!(Interval::from_token("fortnight"), None);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(JobPriority::High < JobPriority::Normal);
        assert!(JobPriority::Normal < JobPriority::Low);
    }

    #[test]
    fn test_trigger_first_run() {
        let now = Instant::now();
        let at = now + Duration::from_secs(5);
        assert_eq!(Trigger::At(at).first_run(now), at);
        assert_eq!(
            Trigger::Every(Interval::Minute).first_run(now),
            now + Duration::from_secs(60)
        );
    }

    #[test]
    fn test_default_options() {
        let opts = JobOptions::default();
        assert_eq!(opts.priority, JobPriority::Normal);
        assert_eq!(opts.max_retries, 3);
        assert_eq!(opts.timeout, Duration::from_secs(300));
    }
}
