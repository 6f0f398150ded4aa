//! Per-operation performance metering.
//!
//! [`PerformanceMeter::measure`] wraps an operation future, records its
//! duration, memory delta, and outcome into a bounded per-operation ring
//! buffer, and raises a typed alert when a threshold is breached. Reports
//! aggregate the buffers into the operator-facing
//! [`PerformanceReport`](report::PerformanceReport).

mod report;
pub mod sys;

pub use report::{OperationReport, PerformanceReport, SystemHealth};

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tracing::warn;

use crate::config::{DEFAULT_HEAP_BYTES_LIMIT, DEFAULT_MEMORY_ALERT_BYTES, DEFAULT_RESPONSE_TIME_ALERT_MS};
use crate::error::DispatchError;
use crate::notify::{Channel, Message, Notifier, Recipient, Severity};
use crate::stores::{AuditSink, AuditTopic, PerformanceAlertRecord};

/// Samples kept per operation.
pub const SERIES_MAX: usize = 200;

/// Samples kept after an overflowing series is trimmed.
pub const SERIES_TRIM: usize = 100;

/// Window used for the health classification.
const RECENT_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Error detail stored per failed sample, at most this many characters.
const ERROR_DETAIL_MAX: usize = 500;

/// How many recent error messages a report includes per operation.
const REPORT_ERRORS: usize = 5;

/// Meter thresholds and the heap limit used for health classification.
#[derive(Debug, Clone, Copy)]
pub struct MeterConfig {
    pub response_time_alert_ms: u64,
    pub memory_alert_bytes: u64,
    pub heap_limit_bytes: u64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            response_time_alert_ms: DEFAULT_RESPONSE_TIME_ALERT_MS,
            memory_alert_bytes: DEFAULT_MEMORY_ALERT_BYTES,
            heap_limit_bytes: DEFAULT_HEAP_BYTES_LIMIT,
        }
    }
}

#[derive(Debug, Clone)]
struct Sample {
    duration: Duration,
    mem_delta: i64,
    success: bool,
    error: Option<String>,
    at: Instant,
}

/// Meters operations and aggregates their outcomes.
pub struct PerformanceMeter {
    config: MeterConfig,
    series: DashMap<String, VecDeque<Sample>>,
    sink: Arc<dyn AuditSink>,
    notifier: Arc<Notifier>,
    /// Where threshold alerts are delivered.
    ops_recipient: Recipient,
}

impl PerformanceMeter {
    pub fn new(
        config: MeterConfig,
        sink: Arc<dyn AuditSink>,
        notifier: Arc<Notifier>,
        ops_recipient: Recipient,
    ) -> Self {
        Self {
            config,
            series: DashMap::new(),
            sink,
            notifier,
            ops_recipient,
        }
    }

    /// Runs `fut`, recording duration, memory delta, and outcome under `op`.
    ///
    /// A success past either threshold raises a performance alert (persisted
    /// and forwarded to the notifier on email + chat). A failure records the
    /// truncated error and propagates unchanged.
    pub async fn measure<T, Fut>(&self, op: &str, fut: Fut) -> Result<T, DispatchError>
    where
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let heap_before = sys::heap_bytes() as i64;
        let started = Instant::now();

        match fut.await {
            Ok(value) => {
                let duration = started.elapsed();
                let mem_delta = sys::heap_bytes() as i64 - heap_before;
                self.record(op, Sample {
                    duration,
                    mem_delta,
                    success: true,
                    error: None,
                    at: Instant::now(),
                });

                if duration.as_millis() as u64 > self.config.response_time_alert_ms {
                    self.raise_alert(op, "slow_operation", serde_json::json!({
                        "duration_ms": duration.as_millis() as u64,
                        "threshold_ms": self.config.response_time_alert_ms,
                    }))
                    .await;
                }
                if mem_delta > self.config.memory_alert_bytes as i64 {
                    self.raise_alert(op, "memory_spike", serde_json::json!({
                        "mem_delta_bytes": mem_delta,
                        "threshold_bytes": self.config.memory_alert_bytes,
                    }))
                    .await;
                }

                Ok(value)
            }
            Err(err) => {
                let duration = started.elapsed();
                let detail: String = err.to_string().chars().take(ERROR_DETAIL_MAX).collect();
                self.record(op, Sample {
                    duration,
                    mem_delta: 0,
                    success: false,
                    error: Some(detail),
                    at: Instant::now(),
                });
                Err(err)
            }
        }
    }

    fn record(&self, op: &str, sample: Sample) {
        let mut series = self.series.entry(op.to_string()).or_default();
        series.push_back(sample);
        if series.len() > SERIES_MAX {
            let drop = series.len() - SERIES_TRIM;
            series.drain(..drop);
        }
    }

    /// Persists a performance alert and forwards it to the operators.
    ///
    /// Alerting is deliberately not circuit-broken: it fires precisely when
    /// the system is degraded. Delivery problems are logged and swallowed.
    async fn raise_alert(&self, op: &str, alert_type: &str, details: serde_json::Value) {
        warn!(op, alert_type, %details, "performance threshold breached");

        let record = PerformanceAlertRecord {
            alert_type: alert_type.to_string(),
            op: op.to_string(),
            details: details.clone(),
            at: Utc::now(),
        };
        match serde_json::to_value(&record) {
            Ok(value) => {
                if let Err(err) = self.sink.append(AuditTopic::PerformanceAlerts, value).await {
                    warn!(error = %err, "failed to persist performance alert");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize performance alert"),
        }

        let message = Message::new(
            format!("Performance alert: {alert_type}"),
            format!("operation {op}: {details}"),
        );
        self.notifier
            .send(
                &self.ops_recipient,
                &message,
                Severity::Normal,
                &[Channel::Email, Channel::Chat],
            )
            .await;
    }

    /// Builds the operator-facing report from the current buffers.
    pub fn report(&self) -> PerformanceReport {
        let now = Instant::now();
        let mut operations = Vec::new();
        let mut recent_total = 0usize;
        let mut recent_failures = 0usize;
        let mut recent_duration_ms = 0.0f64;

        for entry in self.series.iter() {
            let samples = entry.value();
            if samples.is_empty() {
                continue;
            }

            let count = samples.len();
            let successes = samples.iter().filter(|s| s.success).count();
            let durations_ms: Vec<f64> =
                samples.iter().map(|s| s.duration.as_secs_f64() * 1000.0).collect();
            let avg_duration_ms = durations_ms.iter().sum::<f64>() / count as f64;
            let min_duration_ms = durations_ms.iter().cloned().fold(f64::INFINITY, f64::min);
            let max_duration_ms = durations_ms.iter().cloned().fold(0.0, f64::max);
            let avg_mem_delta_bytes =
                samples.iter().map(|s| s.mem_delta as f64).sum::<f64>() / count as f64;

            let recent_errors: Vec<String> = samples
                .iter()
                .rev()
                .filter_map(|s| s.error.clone())
                .take(REPORT_ERRORS)
                .collect();

            for sample in samples.iter() {
                if now.duration_since(sample.at) <= RECENT_WINDOW {
                    recent_total += 1;
                    recent_duration_ms += sample.duration.as_secs_f64() * 1000.0;
                    if !sample.success {
                        recent_failures += 1;
                    }
                }
            }

            operations.push(OperationReport {
                op: entry.key().clone(),
                count,
                success_rate: successes as f64 / count as f64,
                avg_duration_ms,
                min_duration_ms,
                max_duration_ms,
                avg_mem_delta_bytes,
                recent_errors,
            });
        }
        operations.sort_by(|a, b| a.op.cmp(&b.op));

        let recent_error_rate = if recent_total == 0 {
            0.0
        } else {
            recent_failures as f64 / recent_total as f64
        };
        let recent_avg_duration_ms = if recent_total == 0 {
            0.0
        } else {
            recent_duration_ms / recent_total as f64
        };

        let heap_bytes = sys::heap_bytes();
        let health = SystemHealth::classify(
            recent_error_rate,
            recent_avg_duration_ms,
            heap_bytes,
            self.config.heap_limit_bytes,
            self.config.response_time_alert_ms,
        );

        PerformanceReport {
            generated_at: Utc::now(),
            health,
            heap_bytes,
            heap_limit_bytes: self.config.heap_limit_bytes,
            recent_error_rate,
            recent_avg_duration_ms,
            operations,
        }
    }
}
