//! Integration tests for the composed dispatch pipeline.
//!
//! These tests drive the full path — admission, circuit breaker, adaptive
//! cache, spatial index, matcher, notifier, threat meter — against the
//! in-memory collaborator implementations.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fleetmatch::config::{BreakerConfig, ResourceLimits, Settings};
use fleetmatch::dispatch::{DispatchContext, Dispatcher};
use fleetmatch::error::DispatchError;
use fleetmatch::matcher::{Traffic, Weather};
use fleetmatch::model::{Driver, Order, OrderStatus, Position};
use fleetmatch::stores::memory::{
    MemoryActivityStore, MemoryAuditSink, MemoryDeviceStore, MemoryDriverSource,
    MemoryIpReputation, MemoryPerformanceStore, MemoryPreferenceStore, MemoryRecipientDirectory,
};
use fleetmatch::stores::{AuditTopic, DriverSource};
use fleetmatch::threat::ThreatContext;

// =============================================================================
// Test Helpers
// =============================================================================

fn driver_at(id: &str, lat: f64, lon: f64, active_assignments: u32) -> Driver {
    Driver {
        id: id.into(),
        position: Some(Position::new(lat, lon)),
        active: true,
        last_heartbeat: Instant::now(),
        active_assignments,
        preferred_vendors: HashSet::new(),
    }
}

fn order_at(lat: f64, lon: f64) -> Order {
    Order {
        id: "order-1".into(),
        vendor_id: "vendor-1".into(),
        vendor_position: Position::new(lat, lon),
        customer_id: "customer-1".into(),
        total_amount: 32.50,
        status: OrderStatus::DriverPending,
    }
}

fn clear_noon_context() -> DispatchContext {
    DispatchContext {
        weather: Weather::Clear,
        traffic: Traffic::Light,
        local_hour: 12,
        threat: ThreatContext::default(),
    }
}

struct Fixture {
    dispatcher: Arc<Dispatcher>,
    sink: Arc<MemoryAuditSink>,
    reputation: Arc<MemoryIpReputation>,
}

fn build_fixture(settings: Settings, drivers: Arc<dyn DriverSource>) -> Fixture {
    let sink = Arc::new(MemoryAuditSink::new());
    let reputation = Arc::new(MemoryIpReputation::new());

    let dispatcher = Dispatcher::builder(settings)
        .audit_sink(sink.clone())
        .driver_source(drivers)
        .performance_store(Arc::new(MemoryPerformanceStore::new()))
        .preference_store(Arc::new(MemoryPreferenceStore::new()))
        .device_store(Arc::new(MemoryDeviceStore::new()))
        .activity_store(Arc::new(MemoryActivityStore::new()))
        .ip_reputation(reputation.clone())
        .recipient_directory(Arc::new(MemoryRecipientDirectory::new()))
        .build()
        .expect("fixture wiring is complete");

    Fixture {
        dispatcher,
        sink,
        reputation,
    }
}

/// Driver source that counts how many times it was queried.
struct CountingDriverSource {
    inner: MemoryDriverSource,
    calls: AtomicUsize,
}

#[async_trait]
impl DriverSource for CountingDriverSource {
    async fn list_candidates(&self, order: &Order) -> Result<Vec<Driver>, DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.list_candidates(order).await
    }
}

/// Driver source that always fails with a transient error.
struct FailingDriverSource;

#[async_trait]
impl DriverSource for FailingDriverSource {
    async fn list_candidates(&self, _order: &Order) -> Result<Vec<Driver>, DispatchError> {
        Err(DispatchError::Transient("driver store unreachable".into()))
    }
}

// =============================================================================
// Dispatch scenarios
// =============================================================================

#[tokio::test]
async fn test_dispatch_picks_unloaded_driver_at_center() {
    let drivers = Arc::new(MemoryDriverSource::new(vec![
        driver_at("busy", 34.050, -118.250, 2),
        driver_at("idle", 34.050, -118.250, 0),
    ]));
    let fixture = build_fixture(Settings::default(), drivers);

    let outcome = fixture
        .dispatcher
        .dispatch(&order_at(34.050, -118.250), &clear_noon_context())
        .await
        .expect("dispatch succeeds with live drivers at the vendor");

    assert_eq!(outcome.driver_id, "idle");
    assert!(outcome.score > 80.0, "top score {}", outcome.score);

    // The chosen driver was notified and the activity was audited.
    let notifications = fixture.sink.records(AuditTopic::NotificationLogs);
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0]["recipient_id"], "idle");

    let security_logs = fixture.sink.records(AuditTopic::SecurityLogs);
    assert!(security_logs
        .iter()
        .any(|record| record["action"] == "dispatch_order"));
}

#[tokio::test]
async fn test_dispatch_with_stale_driver_returns_not_found() {
    let mut stale = driver_at("stale", 34.050, -118.250, 0);
    stale.last_heartbeat = Instant::now() - Duration::from_secs(11 * 60);
    let drivers = Arc::new(MemoryDriverSource::new(vec![stale]));
    let fixture = build_fixture(Settings::default(), drivers);

    let result = fixture
        .dispatcher
        .dispatch(&order_at(34.050, -118.250), &clear_noon_context())
        .await;

    match result {
        Err(DispatchError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_dispatch_rejected_when_admission_exhausted() {
    let drivers = Arc::new(MemoryDriverSource::new(vec![driver_at(
        "d1", 34.05, -118.25, 0,
    )]));
    let settings = Settings {
        resource_limits: ResourceLimits {
            active_dispatch: 0,
            ..ResourceLimits::default()
        },
        ..Settings::default()
    };
    let fixture = build_fixture(settings, drivers);

    let result = fixture
        .dispatcher
        .dispatch(&order_at(34.05, -118.25), &clear_noon_context())
        .await;

    match result {
        Err(DispatchError::ResourceExhausted { resource, .. }) => {
            assert_eq!(resource, "active_dispatch");
        }
        other => panic!("expected ResourceExhausted, got {other:?}"),
    }

    let alerts = fixture.sink.records(AuditTopic::ResourceAlerts);
    assert!(!alerts.is_empty());
}

#[tokio::test]
async fn test_circuit_opens_after_repeated_source_failures() {
    let settings = Settings {
        circuit: BreakerConfig {
            max_failures: 2,
            reset_timeout: Duration::from_secs(30),
            retries: 1,
            base_delay: Duration::from_millis(1),
        },
        ..Settings::default()
    };
    let fixture = build_fixture(settings, Arc::new(FailingDriverSource));
    let order = order_at(34.05, -118.25);
    let ctx = clear_noon_context();

    for _ in 0..2 {
        let result = fixture.dispatcher.dispatch(&order, &ctx).await;
        assert!(matches!(result, Err(DispatchError::Transient(_))));
    }

    // The vendor-keyed circuit is now open: fail fast without the source.
    let result = fixture.dispatcher.dispatch(&order, &ctx).await;
    match result {
        Err(DispatchError::CircuitOpen { operation }) => assert_eq!(operation, "dispatch"),
        other => panic!("expected CircuitOpen, got {other:?}"),
    }

    let breakers = fixture.dispatcher.status().breakers;
    assert_eq!(breakers.len(), 1);
    assert_eq!(breakers[0].key, "dispatch:vendor-1");
}

#[tokio::test]
async fn test_cached_candidate_set_loads_source_once() {
    let counting = Arc::new(CountingDriverSource {
        inner: MemoryDriverSource::new(vec![driver_at("d1", 34.05, -118.25, 0)]),
        calls: AtomicUsize::new(0),
    });
    let fixture = build_fixture(Settings::default(), counting.clone());
    let order = order_at(34.05, -118.25);
    let ctx = clear_noon_context();

    fixture.dispatcher.dispatch(&order, &ctx).await.unwrap();
    fixture.dispatcher.dispatch(&order, &ctx).await.unwrap();

    assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rapid_dispatches_from_suspicious_ip_record_incident() {
    let drivers = Arc::new(MemoryDriverSource::new(vec![driver_at(
        "d1", 34.05, -118.25, 0,
    )]));
    let fixture = build_fixture(Settings::default(), drivers);
    fixture.dispatcher.threat_meter().add_suspicious_ip("203.0.113.5");

    let order = order_at(34.05, -118.25);
    let mut ctx = clear_noon_context();
    ctx.threat.client_ip = Some("203.0.113.5".into());

    for _ in 0..6 {
        fixture.dispatcher.dispatch(&order, &ctx).await.unwrap();
    }

    let incidents = fixture.sink.records(AuditTopic::SecurityIncidents);
    assert!(!incidents.is_empty(), "rapid suspicious activity must record an incident");
    assert_eq!(incidents.last().unwrap()["severity"], "MEDIUM");
    assert_eq!(incidents.last().unwrap()["subject"], "customer-1");
}

#[tokio::test]
async fn test_status_snapshot_covers_all_subsystems() {
    let drivers = Arc::new(MemoryDriverSource::new(vec![driver_at(
        "d1", 34.05, -118.25, 0,
    )]));
    let fixture = build_fixture(Settings::default(), drivers);

    fixture
        .dispatcher
        .dispatch(&order_at(34.05, -118.25), &clear_noon_context())
        .await
        .unwrap();

    let status = fixture.dispatcher.status();
    assert_eq!(status.resources.len(), 4);
    assert_eq!(status.jobs.len(), 8, "system job registry installed at boot");
    assert_eq!(status.spatial.drivers, 1);
    assert!(status.performance.operations.iter().any(|op| op.op == "dispatch"));
    assert!(status.cache.entries >= 1);
}

#[tokio::test]
async fn test_blacklisted_ip_escalates_threat_level() {
    let drivers = Arc::new(MemoryDriverSource::new(vec![driver_at(
        "d1", 34.05, -118.25, 0,
    )]));
    let fixture = build_fixture(Settings::default(), drivers);
    fixture.reputation.blacklist("198.51.100.20");

    let order = order_at(34.05, -118.25);
    let mut ctx = clear_noon_context();
    ctx.threat.client_ip = Some("198.51.100.20".into());

    fixture.dispatcher.dispatch(&order, &ctx).await.unwrap();

    let incidents = fixture.sink.records(AuditTopic::SecurityIncidents);
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0]["severity"], "MEDIUM");
}

#[tokio::test]
async fn test_background_loop_starts_and_stops() {
    let drivers = Arc::new(MemoryDriverSource::new(vec![]));
    let fixture = build_fixture(Settings::default(), drivers);

    let shutdown = tokio_util::sync::CancellationToken::new();
    let handle = fixture.dispatcher.start_background(shutdown.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
    assert!(result.is_ok(), "scheduler loop must stop on shutdown");
}
