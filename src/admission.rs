//! Resource admission gauges.
//!
//! A fixed set of counted resources with hard limits. Acquisition is an
//! atomic check-and-increment that fails deterministically instead of
//! blocking; the returned permit releases on drop, so every exit path —
//! including panics and cancellations — gives the capacity back.
//!
//! Counted gauges (dispatch slots, database connections) move only through
//! acquire/release. Measured gauges (heap, CPU) are overwritten by the
//! periodic sampler; a heap sample over its limit triggers the registered
//! emergency cleanup.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::ResourceLimits;
use crate::error::DispatchError;
use crate::metrics::sys;
use crate::stores::{AuditSink, AuditTopic, ResourceAlertRecord};

/// Resource types under admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ActiveDispatch,
    HeapBytes,
    CpuPct,
    DbConns,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActiveDispatch => "active_dispatch",
            Self::HeapBytes => "heap_bytes",
            Self::CpuPct => "cpu_pct",
            Self::DbConns => "db_conns",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Gauge {
    current: u64,
    limit: u64,
}

type SharedGauges = Arc<Mutex<HashMap<ResourceKind, Gauge>>>;

/// Operator snapshot of one gauge.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResourceSnapshot {
    pub resource: ResourceKind,
    pub current: u64,
    pub limit: u64,
}

/// A held admission. Releases its amount when dropped.
pub struct ResourcePermit {
    kind: ResourceKind,
    amount: u64,
    gauges: SharedGauges,
}

impl Drop for ResourcePermit {
    fn drop(&mut self) {
        let mut gauges = self.gauges.lock().expect("gauge lock poisoned");
        if let Some(gauge) = gauges.get_mut(&self.kind) {
            gauge.current = gauge.current.saturating_sub(self.amount);
        }
    }
}

impl std::fmt::Debug for ResourcePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePermit")
            .field("kind", &self.kind)
            .field("amount", &self.amount)
            .finish()
    }
}

/// Permits held by [`ResourceGauges::with_resources`].
///
/// Dropped in reverse acquisition order.
struct PermitSet {
    permits: Vec<ResourcePermit>,
}

impl Drop for PermitSet {
    fn drop(&mut self) {
        while let Some(permit) = self.permits.pop() {
            drop(permit);
        }
    }
}

type Callback = Box<dyn Fn() + Send + Sync>;

/// The admission gauge table.
pub struct ResourceGauges {
    gauges: SharedGauges,
    sink: Arc<dyn AuditSink>,
    /// Invoked when dispatch admission is exhausted, so the orchestrator can
    /// prioritize high-value pending orders.
    pressure: Mutex<Option<Callback>>,
    /// Invoked when the heap sample exceeds its limit.
    emergency_cleanup: Mutex<Option<Callback>>,
}

impl ResourceGauges {
    pub fn new(limits: ResourceLimits, sink: Arc<dyn AuditSink>) -> Self {
        let mut gauges = HashMap::new();
        gauges.insert(
            ResourceKind::ActiveDispatch,
            Gauge { current: 0, limit: limits.active_dispatch },
        );
        gauges.insert(
            ResourceKind::HeapBytes,
            Gauge { current: 0, limit: limits.heap_bytes },
        );
        gauges.insert(ResourceKind::CpuPct, Gauge { current: 0, limit: limits.cpu_pct });
        gauges.insert(ResourceKind::DbConns, Gauge { current: 0, limit: limits.db_conns });

        Self {
            gauges: Arc::new(Mutex::new(gauges)),
            sink,
            pressure: Mutex::new(None),
            emergency_cleanup: Mutex::new(None),
        }
    }

    /// Registers the dispatch-pressure callback.
    pub fn set_pressure_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.pressure.lock().expect("callback lock poisoned") = Some(Box::new(callback));
    }

    /// Registers the emergency cleanup invoked on heap exhaustion.
    pub fn set_emergency_cleanup(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.emergency_cleanup.lock().expect("callback lock poisoned") =
            Some(Box::new(callback));
    }

    /// Atomic check-and-increment. Never blocks; rejects deterministically
    /// when `current + amount` would exceed the limit.
    pub fn try_acquire(
        &self,
        kind: ResourceKind,
        amount: u64,
    ) -> Result<ResourcePermit, DispatchError> {
        let mut gauges = self.gauges.lock().expect("gauge lock poisoned");
        let gauge = gauges.get_mut(&kind).expect("all gauges exist from construction");

        if gauge.current + amount > gauge.limit {
            return Err(DispatchError::ResourceExhausted {
                resource: kind.as_str(),
                current: gauge.current,
                limit: gauge.limit,
                requested: amount,
            });
        }
        gauge.current += amount;

        Ok(ResourcePermit {
            kind,
            amount,
            gauges: Arc::clone(&self.gauges),
        })
    }

    /// [`try_acquire`](Self::try_acquire) plus the exhaustion reactions:
    /// a persisted resource alert, a critical log, and the pressure callback
    /// for dispatch admission.
    pub async fn acquire(
        &self,
        kind: ResourceKind,
        amount: u64,
    ) -> Result<ResourcePermit, DispatchError> {
        match self.try_acquire(kind, amount) {
            Ok(permit) => Ok(permit),
            Err(err) => {
                if let DispatchError::ResourceExhausted { current, limit, requested, .. } = err {
                    error!(
                        resource = kind.as_str(),
                        current, limit, requested, "admission rejected"
                    );
                    self.persist_alert("admission_rejected", kind, current, limit, requested)
                        .await;
                    if kind == ResourceKind::ActiveDispatch {
                        if let Some(callback) =
                            self.pressure.lock().expect("callback lock poisoned").as_ref()
                        {
                            callback();
                        }
                    }
                }
                Err(err)
            }
        }
    }

    /// Acquires every requested resource in declaration order, runs `f`, and
    /// releases in reverse order on every exit path.
    pub async fn with_resources<T, F, Fut>(
        &self,
        requests: &[(ResourceKind, u64)],
        f: F,
    ) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let mut held = PermitSet { permits: Vec::with_capacity(requests.len()) };
        for &(kind, amount) in requests {
            held.permits.push(self.acquire(kind, amount).await?);
        }

        let result = f().await;
        drop(held);
        result
    }

    /// Overwrites a measured gauge. Used by external integrations (e.g. a
    /// connection pool reporting checkouts).
    pub fn set_current(&self, kind: ResourceKind, value: u64) {
        let mut gauges = self.gauges.lock().expect("gauge lock poisoned");
        if let Some(gauge) = gauges.get_mut(&kind) {
            gauge.current = value;
        }
    }

    /// Refreshes the measured heap and CPU gauges from the platform probes.
    ///
    /// A heap sample over its limit persists an alert and fires the
    /// registered emergency cleanup.
    pub async fn refresh_samples(&self) {
        let heap = sys::heap_bytes();
        let cpu = sys::cpu_percent();
        self.set_current(ResourceKind::HeapBytes, heap);
        self.set_current(ResourceKind::CpuPct, cpu);

        let heap_limit = self
            .gauges
            .lock()
            .expect("gauge lock poisoned")
            .get(&ResourceKind::HeapBytes)
            .map(|gauge| gauge.limit)
            .unwrap_or(0);

        if heap > 0 && heap > heap_limit {
            error!(heap, heap_limit, "heap over limit, running emergency cleanup");
            self.persist_alert("heap_over_limit", ResourceKind::HeapBytes, heap, heap_limit, 0)
                .await;
            if let Some(callback) =
                self.emergency_cleanup.lock().expect("callback lock poisoned").as_ref()
            {
                callback();
                info!("emergency cleanup complete");
            }
        }
    }

    pub fn snapshot(&self) -> Vec<ResourceSnapshot> {
        let gauges = self.gauges.lock().expect("gauge lock poisoned");
        let mut snapshots: Vec<ResourceSnapshot> = gauges
            .iter()
            .map(|(kind, gauge)| ResourceSnapshot {
                resource: *kind,
                current: gauge.current,
                limit: gauge.limit,
            })
            .collect();
        snapshots.sort_by_key(|s| s.resource.as_str());
        snapshots
    }

    async fn persist_alert(
        &self,
        alert_type: &str,
        kind: ResourceKind,
        current: u64,
        limit: u64,
        requested: u64,
    ) {
        let record = ResourceAlertRecord {
            alert_type: alert_type.to_string(),
            resource: kind.as_str().to_string(),
            current,
            limit,
            requested,
            at: Utc::now(),
        };
        match serde_json::to_value(&record) {
            Ok(value) => {
                if let Err(err) = self.sink.append(AuditTopic::ResourceAlerts, value).await {
                    warn!(error = %err, "failed to persist resource alert");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize resource alert"),
        }
    }
}
