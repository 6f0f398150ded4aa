//! System maintenance jobs installed at boot.
//!
//! Each periodic job keeps one subsystem healthy: cache sweeps and preload,
//! performance and threat reports, resource sampling, spatial index GC, and
//! the demand/utilization projections persisted for downstream planning.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use super::{Interval, JobOptions, JobPriority, Scheduler, Trigger};
use crate::admission::ResourceGauges;
use crate::cache::{AdaptiveCache, PreloadEntry};
use crate::metrics::PerformanceMeter;
use crate::model::Driver;
use crate::spatial::SpatialIndex;
use crate::stores::{AuditSink, AuditTopic, PredictionRecord, SecurityLogRecord};
use crate::threat::ThreatMeter;

/// Produces the preload entries the hourly warm-up should load.
pub type PreloadSpec = Arc<dyn Fn() -> Vec<PreloadEntry<Vec<Driver>>> + Send + Sync>;

/// Everything the system jobs operate on.
pub struct SystemJobContext {
    pub driver_cache: Arc<AdaptiveCache<Vec<Driver>>>,
    pub spatial: Arc<SpatialIndex>,
    pub meter: Arc<PerformanceMeter>,
    pub gauges: Arc<ResourceGauges>,
    pub threat: Arc<ThreatMeter>,
    pub sink: Arc<dyn AuditSink>,
    pub preload: PreloadSpec,
}

/// Registers the standard maintenance jobs.
pub fn install_system_jobs(scheduler: &Scheduler, ctx: SystemJobContext) {
    let SystemJobContext {
        driver_cache,
        spatial,
        meter,
        gauges,
        threat,
        sink,
        preload,
    } = ctx;

    {
        let cache = Arc::clone(&driver_cache);
        scheduler.schedule(
            "cleanup-sweep",
            Trigger::Every(Interval::ThirtyMinutes),
            JobOptions {
                priority: JobPriority::Low,
                ..JobOptions::default()
            },
            move || {
                let cache = Arc::clone(&cache);
                async move {
                    let removed = cache.sweep_expired();
                    debug!(removed, "cleanup sweep finished");
                    Ok(())
                }
            },
        );
    }

    {
        let meter = Arc::clone(&meter);
        let sink = Arc::clone(&sink);
        scheduler.schedule(
            "performance-report",
            Trigger::Every(Interval::TenMinutes),
            JobOptions::default(),
            move || {
                let meter = Arc::clone(&meter);
                let sink = Arc::clone(&sink);
                async move {
                    let report = meter.report();
                    append(&sink, AuditTopic::PerformanceReports, &report).await;
                    Ok(())
                }
            },
        );
    }

    {
        let cache = Arc::clone(&driver_cache);
        let preload = Arc::clone(&preload);
        scheduler.schedule(
            "cache-preload",
            Trigger::Every(Interval::Hour),
            JobOptions {
                priority: JobPriority::Low,
                ..JobOptions::default()
            },
            move || {
                let cache = Arc::clone(&cache);
                let entries = preload();
                async move {
                    let loaded = cache.preload(entries).await;
                    debug!(loaded, "cache preload finished");
                    Ok(())
                }
            },
        );
    }

    {
        let threat = Arc::clone(&threat);
        let sink = Arc::clone(&sink);
        scheduler.schedule(
            "threat-report",
            Trigger::Every(Interval::ThirtyMinutes),
            JobOptions::default(),
            move || {
                let threat = Arc::clone(&threat);
                let sink = Arc::clone(&sink);
                async move {
                    let metrics = threat.metrics();
                    let record = SecurityLogRecord {
                        subject: "system".to_string(),
                        action: "threat_report".to_string(),
                        metadata: serde_json::to_value(metrics)
                            .unwrap_or(serde_json::Value::Null),
                        at: Utc::now(),
                    };
                    append(&sink, AuditTopic::SecurityLogs, &record).await;
                    Ok(())
                }
            },
        );
    }

    {
        let gauges = Arc::clone(&gauges);
        scheduler.schedule(
            "resource-sampler",
            Trigger::Every(Interval::FiveMinutes),
            JobOptions {
                priority: JobPriority::High,
                ..JobOptions::default()
            },
            move || {
                let gauges = Arc::clone(&gauges);
                async move {
                    gauges.refresh_samples().await;
                    Ok(())
                }
            },
        );
    }

    {
        let spatial = Arc::clone(&spatial);
        scheduler.schedule(
            "spatial-gc",
            Trigger::Every(Interval::TenMinutes),
            JobOptions::default(),
            move || {
                let spatial = Arc::clone(&spatial);
                async move {
                    let removed = spatial.gc_stale();
                    debug!(removed, "spatial gc finished");
                    Ok(())
                }
            },
        );
    }

    {
        let spatial = Arc::clone(&spatial);
        let cache = Arc::clone(&driver_cache);
        let sink = Arc::clone(&sink);
        scheduler.schedule(
            "demand-prediction",
            Trigger::Every(Interval::FifteenMinutes),
            JobOptions {
                priority: JobPriority::Low,
                ..JobOptions::default()
            },
            move || {
                let spatial = Arc::clone(&spatial);
                let cache = Arc::clone(&cache);
                let sink = Arc::clone(&sink);
                async move {
                    let stats = spatial.stats();
                    let cache_stats = cache.stats();
                    let record = PredictionRecord {
                        prediction_type: "demand".to_string(),
                        payload: serde_json::json!({
                            "active_drivers": stats.drivers,
                            "covered_cells": stats.cells,
                            "mean_per_cell": stats.mean_per_cell,
                            "cache_hit_rate": cache_stats.hit_rate(),
                        }),
                        timeframe: "next_hour".to_string(),
                        location: None,
                        at: Utc::now(),
                    };
                    append(&sink, AuditTopic::Predictions, &record).await;
                    Ok(())
                }
            },
        );
    }

    {
        let gauges = Arc::clone(&gauges);
        let sink = Arc::clone(&sink);
        scheduler.schedule(
            "utilization-prediction",
            Trigger::Every(Interval::ThirtyMinutes),
            JobOptions {
                priority: JobPriority::Low,
                ..JobOptions::default()
            },
            move || {
                let gauges = Arc::clone(&gauges);
                let sink = Arc::clone(&sink);
                async move {
                    let snapshot = gauges.snapshot();
                    let record = PredictionRecord {
                        prediction_type: "utilization".to_string(),
                        payload: serde_json::to_value(&snapshot)
                            .unwrap_or(serde_json::Value::Null),
                        timeframe: "next_hour".to_string(),
                        location: None,
                        at: Utc::now(),
                    };
                    append(&sink, AuditTopic::Predictions, &record).await;
                    Ok(())
                }
            },
        );
    }
}

async fn append<R: serde::Serialize>(sink: &Arc<dyn AuditSink>, topic: AuditTopic, record: &R) {
    match serde_json::to_value(record) {
        Ok(value) => {
            if let Err(err) = sink.append(topic, value).await {
                warn!(topic = topic.as_str(), error = %err, "system job audit append failed");
            }
        }
        Err(err) => warn!(topic = topic.as_str(), error = %err, "system job serialization failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResourceLimits, SchedulerConfig, ThreatThresholds};
    use crate::metrics::MeterConfig;
    use crate::notify::{Notifier, Recipient, Role};
    use crate::stores::memory::{
        MemoryActivityStore, MemoryAuditSink, MemoryDeviceStore, MemoryIpReputation,
    };
    use std::time::Duration;

    fn context(sink: Arc<MemoryAuditSink>) -> SystemJobContext {
        let notifier = Arc::new(Notifier::new(sink.clone()));
        let audit: Arc<dyn AuditSink> = sink;
        let meter = Arc::new(PerformanceMeter::new(
            MeterConfig::default(),
            Arc::clone(&audit),
            Arc::clone(&notifier),
            Recipient::bare("ops", Role::Admin),
        ));
        let threat = Arc::new(ThreatMeter::new(
            ThreatThresholds::default(),
            Arc::new(MemoryDeviceStore::new()),
            Arc::new(MemoryActivityStore::new()),
            Arc::new(MemoryIpReputation::new()),
            Arc::clone(&audit),
            notifier,
            Recipient::bare("ops", Role::Admin),
        ));
        SystemJobContext {
            driver_cache: Arc::new(AdaptiveCache::new()),
            spatial: Arc::new(SpatialIndex::new(0.01, Duration::from_secs(600))),
            meter,
            gauges: Arc::new(ResourceGauges::new(ResourceLimits::default(), Arc::clone(&audit))),
            threat,
            sink: audit,
            preload: Arc::new(|| Vec::new()),
        }
    }

    #[test]
    fn test_installs_full_registry() {
        let sink = Arc::new(MemoryAuditSink::new());
        let scheduler = Scheduler::new(SchedulerConfig::default());
        install_system_jobs(&scheduler, context(sink));

        let ids: Vec<String> = scheduler.snapshot().into_iter().map(|j| j.id).collect();
        assert_eq!(
            ids,
            vec![
                "cache-preload",
                "cleanup-sweep",
                "demand-prediction",
                "performance-report",
                "resource-sampler",
                "spatial-gc",
                "threat-report",
                "utilization-prediction",
            ]
        );
        assert!(scheduler.snapshot().iter().all(|j| j.periodic));
    }

    #[tokio::test]
    async fn test_report_jobs_persist_records() {
        let sink = Arc::new(MemoryAuditSink::new());
        let scheduler = Arc::new(Scheduler::new(SchedulerConfig {
            max_concurrent_jobs: 8,
            ..SchedulerConfig::default()
        }));
        install_system_jobs(&scheduler, context(sink.clone()));

        // Make every job due immediately.
        for job in scheduler.snapshot() {
            let id = job.id.clone();
            let mut jobs = scheduler.jobs.lock().unwrap();
            jobs.get_mut(&id).unwrap().next_run = std::time::Instant::now();
        }
        Arc::clone(&scheduler).tick();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(sink.records(AuditTopic::PerformanceReports).len(), 1);
        assert_eq!(sink.records(AuditTopic::Predictions).len(), 2);
        let threat_logs = sink.records(AuditTopic::SecurityLogs);
        assert!(threat_logs.iter().any(|r| r["action"] == "threat_report"));
    }
}
