//! In-memory collaborator implementations.
//!
//! Used by the test suites and by embedders that want the core running
//! without external infrastructure. All of them are plain mutex-guarded
//! collections with the same observable contract as the real stores.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    ActivityRecord, ActivityStore, AuditSink, AuditTopic, DeviceRecord, DeviceStore, DriverSource,
    IpReputation, PerformanceStore, PreferenceStore, RecipientDirectory,
};
use crate::error::DispatchError;
use crate::model::{CustomerPrefs, Driver, Order, PerformanceWindow, Position};
use crate::notify::{Recipient, Role};

/// Driver source backed by a mutable vector.
pub struct MemoryDriverSource {
    drivers: Mutex<Vec<Driver>>,
}

impl MemoryDriverSource {
    pub fn new(drivers: Vec<Driver>) -> Self {
        Self {
            drivers: Mutex::new(drivers),
        }
    }

    /// Replaces the driver population.
    pub fn set_drivers(&self, drivers: Vec<Driver>) {
        *self.drivers.lock().expect("driver source lock poisoned") = drivers;
    }
}

#[async_trait]
impl DriverSource for MemoryDriverSource {
    async fn list_candidates(&self, _order: &Order) -> Result<Vec<Driver>, DispatchError> {
        Ok(self.drivers.lock().expect("driver source lock poisoned").clone())
    }
}

/// Performance store backed by a map of windows.
#[derive(Default)]
pub struct MemoryPerformanceStore {
    windows: Mutex<HashMap<String, PerformanceWindow>>,
}

impl MemoryPerformanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_window(&self, driver_id: impl Into<String>, window: PerformanceWindow) {
        self.windows
            .lock()
            .expect("performance store lock poisoned")
            .insert(driver_id.into(), window);
    }
}

#[async_trait]
impl PerformanceStore for MemoryPerformanceStore {
    async fn fetch_window(
        &self,
        driver_id: &str,
        _since: DateTime<Utc>,
    ) -> Result<PerformanceWindow, DispatchError> {
        Ok(self
            .windows
            .lock()
            .expect("performance store lock poisoned")
            .get(driver_id)
            .copied()
            .unwrap_or_default())
    }
}

/// Preference store backed by a map of customer preferences.
#[derive(Default)]
pub struct MemoryPreferenceStore {
    prefs: Mutex<HashMap<String, CustomerPrefs>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_prefs(&self, customer_id: impl Into<String>, prefs: CustomerPrefs) {
        self.prefs
            .lock()
            .expect("preference store lock poisoned")
            .insert(customer_id.into(), prefs);
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferenceStore {
    async fn customer(&self, customer_id: &str) -> Result<CustomerPrefs, DispatchError> {
        Ok(self
            .prefs
            .lock()
            .expect("preference store lock poisoned")
            .get(customer_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Device history backed by a map of device lists.
#[derive(Default)]
pub struct MemoryDeviceStore {
    devices: Mutex<HashMap<String, Vec<DeviceRecord>>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, subject: impl Into<String>, device: DeviceRecord) {
        self.devices
            .lock()
            .expect("device store lock poisoned")
            .entry(subject.into())
            .or_default()
            .push(device);
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn recent(&self, subject: &str) -> Result<Vec<DeviceRecord>, DispatchError> {
        Ok(self
            .devices
            .lock()
            .expect("device store lock poisoned")
            .get(subject)
            .cloned()
            .unwrap_or_default())
    }
}

/// Activity history backed by per-subject vectors.
#[derive(Default)]
pub struct MemoryActivityStore {
    activity: Mutex<HashMap<String, Vec<ActivityRecord>>>,
}

impl MemoryActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, subject: impl Into<String>, action: impl Into<String>) {
        self.record_located(subject, action, None);
    }

    pub fn record_located(
        &self,
        subject: impl Into<String>,
        action: impl Into<String>,
        position: Option<Position>,
    ) {
        self.activity
            .lock()
            .expect("activity store lock poisoned")
            .entry(subject.into())
            .or_default()
            .push(ActivityRecord {
                action: action.into(),
                at: Utc::now(),
                position,
            });
    }
}

#[async_trait]
impl ActivityStore for MemoryActivityStore {
    async fn recent(
        &self,
        subject: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActivityRecord>, DispatchError> {
        Ok(self
            .activity
            .lock()
            .expect("activity store lock poisoned")
            .get(subject)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| record.at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// IP reputation backed by a static blacklist.
#[derive(Default)]
pub struct MemoryIpReputation {
    blacklist: Mutex<Vec<String>>,
}

impl MemoryIpReputation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blacklist(&self, ip: impl Into<String>) {
        self.blacklist
            .lock()
            .expect("ip reputation lock poisoned")
            .push(ip.into());
    }
}

#[async_trait]
impl IpReputation for MemoryIpReputation {
    async fn is_blacklisted(&self, ip: &str) -> Result<bool, DispatchError> {
        Ok(self
            .blacklist
            .lock()
            .expect("ip reputation lock poisoned")
            .iter()
            .any(|entry| entry == ip))
    }
}

/// Recipient directory backed by a map; unknown subjects get a bare
/// driver-role recipient.
#[derive(Default)]
pub struct MemoryRecipientDirectory {
    recipients: Mutex<HashMap<String, Recipient>>,
}

impl MemoryRecipientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_recipient(&self, recipient: Recipient) {
        self.recipients
            .lock()
            .expect("recipient directory lock poisoned")
            .insert(recipient.id.clone(), recipient);
    }
}

#[async_trait]
impl RecipientDirectory for MemoryRecipientDirectory {
    async fn recipient_for(&self, subject: &str) -> Result<Recipient, DispatchError> {
        Ok(self
            .recipients
            .lock()
            .expect("recipient directory lock poisoned")
            .get(subject)
            .cloned()
            .unwrap_or_else(|| Recipient::bare(subject, Role::Driver)))
    }
}

/// Audit sink appending to per-topic vectors.
#[derive(Default)]
pub struct MemoryAuditSink {
    topics: Mutex<HashMap<&'static str, Vec<serde_json::Value>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records appended to `topic`, in append order.
    pub fn records(&self, topic: AuditTopic) -> Vec<serde_json::Value> {
        self.topics
            .lock()
            .expect("audit sink lock poisoned")
            .get(topic.as_str())
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(
        &self,
        topic: AuditTopic,
        record: serde_json::Value,
    ) -> Result<(), DispatchError> {
        self.topics
            .lock()
            .expect("audit sink lock poisoned")
            .entry(topic.as_str())
            .or_default()
            .push(record);
        Ok(())
    }
}
