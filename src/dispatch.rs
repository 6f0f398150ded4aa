//! Dispatch orchestrator.
//!
//! Composes the stateful subsystems into the one request-driven operation:
//! admission, circuit-broken candidate loading through the adaptive cache
//! and spatial index, ranking, driver notification, and threat scoring.
//!
//! Built once at startup via [`DispatcherBuilder`]; every subsystem is an
//! owned value behind an `Arc`, so tests stay hermetic and nothing is a
//! process global.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Timelike, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::{ResourceGauges, ResourceKind, ResourceSnapshot};
use crate::breaker::{BreakerSnapshot, CircuitBreakers};
use crate::cache::{AdaptiveCache, CacheStats};
use crate::config::Settings;
use crate::error::DispatchError;
use crate::geo::CellKey;
use crate::matcher::{self, MatchContext, Traffic, Weather};
use crate::metrics::{MeterConfig, PerformanceMeter, PerformanceReport};
use crate::model::{Driver, Order};
use crate::notify::{Channel, ChannelAdapter, Message, Notifier, Recipient, Role, Severity};
use crate::scheduler::{
    install_system_jobs, JobOptions, JobPriority, JobSnapshot, Scheduler, SystemJobContext,
    Trigger,
};
use crate::spatial::{SpatialIndex, SpatialStats};
use crate::stores::{
    ActivityStore, AuditSink, DeviceStore, DriverSource, IpReputation, PerformanceStore,
    PreferenceStore, RecipientDirectory,
};
use crate::threat::{ThreatContext, ThreatLevel, ThreatMeter, ThreatMetrics};

/// Base TTL for the cached candidate set, in minutes.
const DRIVER_SET_TTL_MINUTES: u64 = 2;

/// Performance window length fetched before ranking.
const PERFORMANCE_WINDOW_DAYS: i64 = 30;

/// Request-scoped context for one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub weather: Weather,
    pub traffic: Traffic,
    /// Local hour of day, 0-23.
    pub local_hour: u32,
    pub threat: ThreatContext,
}

impl DispatchContext {
    /// Context for the current wall-clock hour with clear conditions.
    pub fn now() -> Self {
        let local_hour = chrono::Local::now().hour();
        Self {
            weather: Weather::Clear,
            traffic: Traffic::Light,
            local_hour,
            threat: ThreatContext {
                local_hour,
                ..ThreatContext::default()
            },
        }
    }
}

/// A successful dispatch decision.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub driver_id: String,
    pub score: f64,
}

/// Read-only operator snapshot of every subsystem.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub performance: PerformanceReport,
    pub spatial: SpatialStats,
    pub resources: Vec<ResourceSnapshot>,
    pub breakers: Vec<BreakerSnapshot>,
    pub jobs: Vec<JobSnapshot>,
    pub cache: CacheStats,
    pub threat: ThreatMetrics,
}

/// The composed dispatch service.
pub struct Dispatcher {
    settings: Settings,
    driver_cache: Arc<AdaptiveCache<Vec<Driver>>>,
    spatial: Arc<SpatialIndex>,
    breakers: Arc<CircuitBreakers>,
    gauges: Arc<ResourceGauges>,
    meter: Arc<PerformanceMeter>,
    threat: Arc<ThreatMeter>,
    notifier: Arc<Notifier>,
    scheduler: Arc<Scheduler>,
    drivers: Arc<dyn DriverSource>,
    performance: Arc<dyn PerformanceStore>,
    preferences: Arc<dyn PreferenceStore>,
    recipients: Arc<dyn RecipientDirectory>,
}

impl Dispatcher {
    pub fn builder(settings: Settings) -> DispatcherBuilder {
        DispatcherBuilder::new(settings)
    }

    /// Dispatches one order: picks the best live driver near the vendor and
    /// notifies it.
    ///
    /// The whole attempt runs inside dispatch admission and the vendor-keyed
    /// circuit breaker. The requesting customer's activity is threat-scored
    /// whatever the outcome.
    pub async fn dispatch(
        &self,
        order: &Order,
        ctx: &DispatchContext,
    ) -> Result<DispatchOutcome, DispatchError> {
        let result = self
            .gauges
            .with_resources(&[(ResourceKind::ActiveDispatch, 1)], || async {
                self.breakers
                    .run("dispatch", &order.vendor_id, self.settings.circuit, || {
                        self.attempt(order, ctx)
                    })
                    .await
            })
            .await;

        let assessment = self
            .threat
            .score(&order.customer_id, "dispatch_order", &ctx.threat)
            .await;
        if assessment.level == ThreatLevel::High {
            warn!(
                customer = %order.customer_id,
                score = assessment.score,
                "dispatch requested by high-threat subject"
            );
        }

        match &result {
            Ok(outcome) => info!(
                order = %order.id,
                driver = %outcome.driver_id,
                score = outcome.score,
                "order dispatched"
            ),
            Err(err) => debug!(order = %order.id, code = err.code(), "dispatch failed"),
        }
        result
    }

    async fn attempt(
        &self,
        order: &Order,
        ctx: &DispatchContext,
    ) -> Result<DispatchOutcome, DispatchError> {
        let zone = CellKey::for_position(
            order.vendor_position.lat,
            order.vendor_position.lon,
            self.settings.spatial_grid_degrees,
        );
        let cache_key = format!("drivers:{}:{}", order.vendor_id, zone);

        self.driver_cache
            .get_or_load(&cache_key, DRIVER_SET_TTL_MINUTES, || async {
                let drivers = self.drivers.list_candidates(order).await?;
                self.spatial.upsert_drivers(drivers.clone());
                Ok(drivers)
            })
            .await?;

        let nearby = self.spatial.near(
            order.vendor_position.lat,
            order.vendor_position.lon,
            self.settings.dispatch_radius_miles,
        );
        if nearby.is_empty() {
            return Err(DispatchError::NotFound(format!(
                "no live drivers within {} miles of vendor {}",
                self.settings.dispatch_radius_miles, order.vendor_id
            )));
        }

        let match_ctx = self.build_match_context(order, &nearby, ctx).await;
        let ranked = matcher::rank(order, nearby, &match_ctx);
        let top = ranked
            .into_iter()
            .next()
            .expect("ranking preserves the non-empty candidate list");

        self.notify_driver(&top.driver, order).await;

        Ok(DispatchOutcome {
            driver_id: top.driver.id.clone(),
            score: top.score,
        })
    }

    /// Loads the historical snapshot the matcher ranks against.
    ///
    /// Store failures degrade to the matcher's neutral defaults rather than
    /// failing the dispatch.
    async fn build_match_context(
        &self,
        order: &Order,
        candidates: &[Driver],
        ctx: &DispatchContext,
    ) -> MatchContext {
        let mut match_ctx = MatchContext::new(ctx.weather, ctx.traffic, ctx.local_hour);
        match_ctx.heartbeat_grace = self.settings.availability_heartbeat;

        let since = Utc::now() - ChronoDuration::days(PERFORMANCE_WINDOW_DAYS);
        let windows = join_all(candidates.iter().map(|driver| {
            let id = driver.id.clone();
            async move { (id.clone(), self.performance.fetch_window(&id, since).await) }
        }))
        .await;
        for (driver_id, window) in windows {
            match window {
                Ok(window) => {
                    match_ctx.performance.insert(driver_id, window);
                }
                Err(err) => {
                    warn!(driver = %driver_id, error = %err, "performance window fetch failed")
                }
            }
        }

        match self.preferences.customer(&order.customer_id).await {
            Ok(prefs) => match_ctx.prefs = prefs,
            Err(err) => {
                warn!(customer = %order.customer_id, error = %err, "preference fetch failed")
            }
        }

        match_ctx
    }

    async fn notify_driver(&self, driver: &Driver, order: &Order) {
        let recipient = match self.recipients.recipient_for(&driver.id).await {
            Ok(recipient) => recipient,
            Err(err) => {
                warn!(driver = %driver.id, error = %err, "recipient lookup failed");
                Recipient::bare(&driver.id, Role::Driver)
            }
        };

        let message = Message::new(
            "New delivery assignment",
            format!("Order {} from vendor {} is ready for pickup", order.id, order.vendor_id),
        );
        let channels = {
            let optimal = Notifier::optimal_channels(&recipient, Severity::Normal);
            if optimal.is_empty() {
                vec![Channel::Push]
            } else {
                optimal
            }
        };
        self.notifier
            .send(&recipient, &message, Severity::Normal, &channels)
            .await;
    }

    /// Starts the background scheduler loop.
    pub fn start_background(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.scheduler).run(shutdown))
    }

    /// Read-only status snapshot for operators.
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            performance: self.meter.report(),
            spatial: self.spatial.stats(),
            resources: self.gauges.snapshot(),
            breakers: self.breakers.snapshot(),
            jobs: self.scheduler.snapshot(),
            cache: self.driver_cache.stats(),
            threat: self.threat.metrics(),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn threat_meter(&self) -> &Arc<ThreatMeter> {
        &self.threat
    }
}

/// Wires the subsystems and collaborators into a [`Dispatcher`].
pub struct DispatcherBuilder {
    settings: Settings,
    sink: Option<Arc<dyn AuditSink>>,
    drivers: Option<Arc<dyn DriverSource>>,
    performance: Option<Arc<dyn PerformanceStore>>,
    preferences: Option<Arc<dyn PreferenceStore>>,
    devices: Option<Arc<dyn DeviceStore>>,
    activities: Option<Arc<dyn ActivityStore>>,
    reputation: Option<Arc<dyn IpReputation>>,
    recipients: Option<Arc<dyn RecipientDirectory>>,
    adapters: Vec<(Channel, Arc<dyn ChannelAdapter>)>,
    ops_recipient: Recipient,
}

impl DispatcherBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            sink: None,
            drivers: None,
            performance: None,
            preferences: None,
            devices: None,
            activities: None,
            reputation: None,
            recipients: None,
            adapters: Vec::new(),
            ops_recipient: Recipient::bare("ops", Role::Admin),
        }
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn driver_source(mut self, drivers: Arc<dyn DriverSource>) -> Self {
        self.drivers = Some(drivers);
        self
    }

    pub fn performance_store(mut self, store: Arc<dyn PerformanceStore>) -> Self {
        self.performance = Some(store);
        self
    }

    pub fn preference_store(mut self, store: Arc<dyn PreferenceStore>) -> Self {
        self.preferences = Some(store);
        self
    }

    pub fn device_store(mut self, store: Arc<dyn DeviceStore>) -> Self {
        self.devices = Some(store);
        self
    }

    pub fn activity_store(mut self, store: Arc<dyn ActivityStore>) -> Self {
        self.activities = Some(store);
        self
    }

    pub fn ip_reputation(mut self, reputation: Arc<dyn IpReputation>) -> Self {
        self.reputation = Some(reputation);
        self
    }

    pub fn recipient_directory(mut self, recipients: Arc<dyn RecipientDirectory>) -> Self {
        self.recipients = Some(recipients);
        self
    }

    pub fn channel_adapter(mut self, channel: Channel, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.push((channel, adapter));
        self
    }

    pub fn ops_recipient(mut self, recipient: Recipient) -> Self {
        self.ops_recipient = recipient;
        self
    }

    /// Builds the dispatcher and installs the system job registry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when a required collaborator is missing.
    pub fn build(self) -> Result<Arc<Dispatcher>, DispatchError> {
        let sink = self.require(self.sink.clone(), "audit sink")?;
        let drivers = self.require(self.drivers.clone(), "driver source")?;
        let performance = self.require(self.performance.clone(), "performance store")?;
        let preferences = self.require(self.preferences.clone(), "preference store")?;
        let devices = self.require(self.devices.clone(), "device store")?;
        let activities = self.require(self.activities.clone(), "activity store")?;
        let reputation = self.require(self.reputation.clone(), "ip reputation")?;
        let recipients = self.require(self.recipients.clone(), "recipient directory")?;

        let mut notifier = Notifier::new(Arc::clone(&sink));
        for (channel, adapter) in self.adapters {
            notifier = notifier.with_adapter(channel, adapter);
        }
        let notifier = Arc::new(notifier);

        let meter = Arc::new(PerformanceMeter::new(
            MeterConfig {
                response_time_alert_ms: self.settings.response_time_alert_ms,
                memory_alert_bytes: self.settings.memory_alert_bytes,
                heap_limit_bytes: self.settings.resource_limits.heap_bytes,
            },
            Arc::clone(&sink),
            Arc::clone(&notifier),
            self.ops_recipient.clone(),
        ));
        let breakers = Arc::new(CircuitBreakers::new(Arc::clone(&meter)));
        let gauges = Arc::new(ResourceGauges::new(
            self.settings.resource_limits,
            Arc::clone(&sink),
        ));
        let threat = Arc::new(ThreatMeter::new(
            self.settings.threat,
            devices,
            activities,
            reputation,
            Arc::clone(&sink),
            Arc::clone(&notifier),
            self.ops_recipient,
        ));

        let driver_cache: Arc<AdaptiveCache<Vec<Driver>>> = Arc::new(AdaptiveCache::new());
        let spatial = Arc::new(SpatialIndex::new(
            self.settings.spatial_grid_degrees,
            self.settings.driver_liveness,
        ));
        let scheduler = Arc::new(Scheduler::new(self.settings.scheduler));

        // Heap exhaustion drops every reconstructible structure.
        {
            let cache = Arc::clone(&driver_cache);
            let spatial = Arc::clone(&spatial);
            gauges.set_emergency_cleanup(move || {
                cache.clear();
                spatial.clear();
            });
        }
        // Dispatch saturation queues a high-priority reprioritization pass.
        {
            let scheduler = Arc::clone(&scheduler);
            gauges.set_pressure_callback(move || {
                scheduler.schedule(
                    "prioritize-pending-orders",
                    Trigger::At(std::time::Instant::now()),
                    JobOptions {
                        priority: JobPriority::High,
                        ..JobOptions::default()
                    },
                    || async {
                        info!("reprioritizing high-value pending orders under dispatch pressure");
                        Ok(())
                    },
                );
            });
        }

        install_system_jobs(
            &scheduler,
            SystemJobContext {
                driver_cache: Arc::clone(&driver_cache),
                spatial: Arc::clone(&spatial),
                meter: Arc::clone(&meter),
                gauges: Arc::clone(&gauges),
                threat: Arc::clone(&threat),
                sink: Arc::clone(&sink),
                preload: Arc::new(|| Vec::new()),
            },
        );

        Ok(Arc::new(Dispatcher {
            settings: self.settings,
            driver_cache,
            spatial,
            breakers,
            gauges,
            meter,
            threat,
            notifier,
            scheduler,
            drivers,
            performance,
            preferences,
            recipients,
        }))
    }

    fn require<T>(&self, value: Option<T>, name: &str) -> Result<T, DispatchError> {
        value.ok_or_else(|| DispatchError::InvalidArgument(format!("{name} is required")))
    }
}
