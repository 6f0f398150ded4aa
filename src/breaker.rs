//! Per-operation circuit breakers with a retry wrapper.
//!
//! One breaker exists per `(operation, identifier)` key. Consecutive
//! transient failures open the circuit; an open circuit fails fast until its
//! reset deadline passes, then a single half-open trial decides whether it
//! closes again.
//!
//! # State Machine
//!
//! ```text
//! Closed --[failures >= max_failures]--> Open
//! Open --[now > reset_at, next run]--> HalfOpen
//! HalfOpen --[trial succeeds]--> Closed (failures = 0)
//! HalfOpen --[trial fails]--> Open (reset_at = now + reset_timeout)
//! ```
//!
//! [`CircuitBreakers::run`] adds the retry loop on top: up to the configured
//! attempt budget, linear backoff between attempts, each attempt wrapped in
//! the performance meter. Attempts that find the circuit open short-circuit
//! without consuming retries.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::BreakerConfig;
use crate::error::DispatchError;
use crate::metrics::PerformanceMeter;

/// Error patterns kept per breaker key.
pub const ERROR_LOG_MAX: usize = 50;

/// Error patterns kept after an overflowing log is trimmed.
pub const ERROR_LOG_TRIM: usize = 25;

/// Stored error message length bound.
const ERROR_MESSAGE_MAX: usize = 500;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation; failures are counted.
    Closed,
    /// Failing fast until the reset deadline.
    Open,
    /// One trial request decides the next state.
    HalfOpen,
}

#[derive(Debug, Clone)]
struct ErrorPattern {
    message: String,
    at: Instant,
}

#[derive(Debug)]
struct BreakerEntry {
    state: CircuitState,
    failures: u32,
    reset_at: Option<Instant>,
    errors: VecDeque<ErrorPattern>,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            reset_at: None,
            errors: VecDeque::new(),
        }
    }
}

/// Operator snapshot of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failures: u32,
    /// Milliseconds until an open circuit allows a trial, if open.
    pub reset_in_ms: Option<u64>,
    pub recorded_errors: usize,
}

/// Table of circuit breakers keyed by `operation:identifier`.
///
/// State transitions for one key are serialized by the table's per-entry
/// locks; the protected function itself runs outside any lock.
pub struct CircuitBreakers {
    table: DashMap<String, BreakerEntry>,
    meter: Arc<PerformanceMeter>,
}

impl CircuitBreakers {
    pub fn new(meter: Arc<PerformanceMeter>) -> Self {
        Self {
            table: DashMap::new(),
            meter,
        }
    }

    /// Runs `f` under the breaker for `(op, id)` with retries.
    ///
    /// `f` is invoked once per attempt. Non-retryable errors propagate
    /// immediately; everything else is retried up to `cfg.retries` attempts
    /// with a linear `cfg.base_delay * attempt` sleep in between. The final
    /// failure is logged as a critical action and propagated.
    pub async fn run<T, F, Fut>(
        &self,
        op: &str,
        id: &str,
        cfg: BreakerConfig,
        f: F,
    ) -> Result<T, DispatchError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let key = format!("{op}:{id}");
        let budget = cfg.retries.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            // An open circuit rejects without consuming retry budget.
            self.check_gate(&key, op)?;

            match self.meter.measure(op, f()).await {
                Ok(value) => {
                    self.on_success(&key);
                    return Ok(value);
                }
                Err(err) => {
                    self.record_error(&key, &err);
                    if err.trips_breaker() {
                        self.on_failure(&key, &cfg);
                    }
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    if attempt >= budget {
                        error!(
                            op,
                            id,
                            attempts = attempt,
                            error = %err,
                            "operation failed after final retry"
                        );
                        return Err(err);
                    }
                    debug!(op, id, attempt, "attempt failed, backing off");
                    tokio::time::sleep(cfg.base_delay * attempt).await;
                }
            }
        }
    }

    /// Gate check before an attempt. Transitions Open to HalfOpen once the
    /// reset deadline has passed.
    fn check_gate(&self, key: &str, op: &str) -> Result<(), DispatchError> {
        let mut entry = self.table.entry(key.to_string()).or_default();
        match entry.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let past_deadline = entry
                    .reset_at
                    .map(|reset_at| Instant::now() > reset_at)
                    .unwrap_or(true);
                if past_deadline {
                    entry.state = CircuitState::HalfOpen;
                    info!(key, "circuit half-open, allowing trial request");
                    Ok(())
                } else {
                    Err(DispatchError::CircuitOpen {
                        operation: op.to_string(),
                    })
                }
            }
        }
    }

    fn on_success(&self, key: &str) {
        let mut entry = self.table.entry(key.to_string()).or_default();
        if entry.state != CircuitState::Closed {
            info!(key, "circuit closed");
        }
        entry.state = CircuitState::Closed;
        entry.failures = 0;
        entry.reset_at = None;
    }

    fn on_failure(&self, key: &str, cfg: &BreakerConfig) {
        let mut entry = self.table.entry(key.to_string()).or_default();
        match entry.state {
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.reset_at = Some(Instant::now() + cfg.reset_timeout);
                info!(key, "circuit re-opened after failed trial");
            }
            CircuitState::Closed => {
                entry.failures += 1;
                if entry.failures >= cfg.max_failures {
                    entry.state = CircuitState::Open;
                    entry.reset_at = Some(Instant::now() + cfg.reset_timeout);
                    info!(
                        key,
                        failures = entry.failures,
                        reset_timeout_ms = cfg.reset_timeout.as_millis() as u64,
                        "circuit opened"
                    );
                }
            }
            // The gate rejects while open; nothing to count.
            CircuitState::Open => {}
        }
    }

    fn record_error(&self, key: &str, err: &DispatchError) {
        let mut entry = self.table.entry(key.to_string()).or_default();
        entry.errors.push_back(ErrorPattern {
            message: err.to_string().chars().take(ERROR_MESSAGE_MAX).collect(),
            at: Instant::now(),
        });
        if entry.errors.len() > ERROR_LOG_MAX {
            let drop = entry.errors.len() - ERROR_LOG_TRIM;
            entry.errors.drain(..drop);
        }
    }

    /// Current state of the breaker for `(op, id)`, if one exists.
    pub fn state(&self, op: &str, id: &str) -> Option<CircuitState> {
        self.table.get(&format!("{op}:{id}")).map(|entry| entry.state)
    }

    /// Consecutive failure count for `(op, id)`, if the breaker exists.
    pub fn failures(&self, op: &str, id: &str) -> Option<u32> {
        self.table
            .get(&format!("{op}:{id}"))
            .map(|entry| entry.failures)
    }

    /// Operator snapshot of the whole table.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<BreakerSnapshot> = self
            .table
            .iter()
            .map(|entry| BreakerSnapshot {
                key: entry.key().clone(),
                state: entry.state,
                failures: entry.failures,
                reset_in_ms: entry.reset_at.and_then(|reset_at| {
                    reset_at
                        .checked_duration_since(now)
                        .map(|d| d.as_millis() as u64)
                }),
                recorded_errors: entry.errors.len(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MeterConfig;
    use crate::notify::{Notifier, Recipient, Role};
    use crate::stores::memory::MemoryAuditSink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn breakers() -> CircuitBreakers {
        let sink = Arc::new(MemoryAuditSink::new());
        let notifier = Arc::new(Notifier::new(sink.clone()));
        let meter = Arc::new(PerformanceMeter::new(
            MeterConfig::default(),
            sink,
            notifier,
            Recipient::bare("ops", Role::Admin),
        ));
        CircuitBreakers::new(meter)
    }

    fn single_attempt(max_failures: u32, reset_timeout: Duration) -> BreakerConfig {
        BreakerConfig {
            max_failures,
            reset_timeout,
            retries: 1,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let breakers = breakers();
        let value = breakers
            .run("op", "k", BreakerConfig::default(), || async { Ok(7u32) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(breakers.state("op", "k"), Some(CircuitState::Closed));
        assert_eq!(breakers.failures("op", "k"), Some(0));
    }

    #[tokio::test]
    async fn test_opens_after_max_failures() {
        let breakers = breakers();
        let cfg = single_attempt(2, Duration::from_secs(30));

        for _ in 0..2 {
            let result: Result<(), _> = breakers
                .run("op", "k", cfg, || async {
                    Err(DispatchError::Transient("down".into()))
                })
                .await;
            assert!(result.is_err());
        }

        assert_eq!(breakers.state("op", "k"), Some(CircuitState::Open));
    }

    #[tokio::test]
    async fn test_max_failures_one_opens_on_first_failure() {
        let breakers = breakers();
        let cfg = single_attempt(1, Duration::from_secs(30));

        let _: Result<(), _> = breakers
            .run("op", "k", cfg, || async {
                Err(DispatchError::Transient("down".into()))
            })
            .await;

        assert_eq!(breakers.state("op", "k"), Some(CircuitState::Open));
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_calling() {
        let breakers = breakers();
        let cfg = single_attempt(1, Duration::from_secs(30));

        let _: Result<(), _> = breakers
            .run("op", "k", cfg, || async {
                Err(DispatchError::Transient("down".into()))
            })
            .await;

        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = breakers
            .run("op", "k", cfg, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(DispatchError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_open_then_half_open_then_closed() {
        let breakers = breakers();
        let cfg = single_attempt(2, Duration::from_millis(100));

        for _ in 0..2 {
            let _: Result<(), _> = breakers
                .run("op", "k", cfg, || async {
                    Err(DispatchError::Transient("down".into()))
                })
                .await;
        }
        assert_eq!(breakers.state("op", "k"), Some(CircuitState::Open));

        // Within the reset window: fail fast.
        let result: Result<(), _> = breakers.run("op", "k", cfg, || async { Ok(()) }).await;
        assert!(matches!(result, Err(DispatchError::CircuitOpen { .. })));

        // Past the reset window: the trial passes and the circuit closes.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let value = breakers
            .run("op", "k", cfg, || async { Ok(42u32) })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(breakers.state("op", "k"), Some(CircuitState::Closed));
        assert_eq!(breakers.failures("op", "k"), Some(0));
    }

    #[tokio::test]
    async fn test_failed_trial_reopens() {
        let breakers = breakers();
        let cfg = single_attempt(1, Duration::from_millis(50));

        let _: Result<(), _> = breakers
            .run("op", "k", cfg, || async {
                Err(DispatchError::Transient("down".into()))
            })
            .await;
        assert_eq!(breakers.state("op", "k"), Some(CircuitState::Open));

        tokio::time::sleep(Duration::from_millis(80)).await;
        let _: Result<(), _> = breakers
            .run("op", "k", cfg, || async {
                Err(DispatchError::Transient("still down".into()))
            })
            .await;
        assert_eq!(breakers.state("op", "k"), Some(CircuitState::Open));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breakers = breakers();
        let cfg = single_attempt(5, Duration::from_secs(30));

        for _ in 0..3 {
            let _: Result<(), _> = breakers
                .run("op", "k", cfg, || async {
                    Err(DispatchError::Transient("blip".into()))
                })
                .await;
        }
        assert_eq!(breakers.failures("op", "k"), Some(3));

        breakers
            .run("op", "k", cfg, || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(breakers.failures("op", "k"), Some(0));
    }

    #[tokio::test]
    async fn test_retry_loop_recovers() {
        let breakers = breakers();
        let cfg = BreakerConfig {
            max_failures: 10,
            reset_timeout: Duration::from_secs(30),
            retries: 3,
            base_delay: Duration::from_millis(5),
        };

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        let value = breakers
            .run("op", "k", cfg, move || {
                let n = calls_in.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(DispatchError::Transient("warming up".into()))
                    } else {
                        Ok(99u32)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 99);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried_and_does_not_trip() {
        let breakers = breakers();
        let cfg = BreakerConfig {
            max_failures: 1,
            ..BreakerConfig::default()
        };

        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = breakers
            .run("op", "k", cfg, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DispatchError::NotFound("no drivers".into())) }
            })
            .await;

        assert!(matches!(result, Err(DispatchError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breakers.state("op", "k"), Some(CircuitState::Closed));
        assert_eq!(breakers.failures("op", "k"), Some(0));
    }

    #[tokio::test]
    async fn test_error_log_trims() {
        let breakers = breakers();
        let cfg = BreakerConfig {
            max_failures: 1_000,
            reset_timeout: Duration::from_secs(30),
            retries: 1,
            base_delay: Duration::from_millis(1),
        };

        for i in 0..(ERROR_LOG_MAX + 1) {
            let _: Result<(), _> = breakers
                .run("op", "k", cfg, || async move {
                    Err(DispatchError::Transient(format!("failure {i}")))
                })
                .await;
        }

        let snapshot = breakers.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].recorded_errors, ERROR_LOG_TRIM);
    }

    #[tokio::test]
    async fn test_snapshot_reports_open_deadline() {
        let breakers = breakers();
        let cfg = single_attempt(1, Duration::from_secs(30));
        let _: Result<(), _> = breakers
            .run("op", "k", cfg, || async {
                Err(DispatchError::Transient("down".into()))
            })
            .await;

        let snapshot = breakers.snapshot();
        assert_eq!(snapshot[0].state, CircuitState::Open);
        assert!(snapshot[0].reset_in_ms.unwrap() > 25_000);
    }
}
