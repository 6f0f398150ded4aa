//! Core domain types shared across the dispatch pipeline.
//!
//! Driver records inside the spatial index are copies of what the external
//! driver source returned, never aliases into it. Orders are read-only here;
//! their persistence lives outside the core.

use std::collections::HashSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// A geographic position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

impl Position {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// A courier as seen by the dispatch core.
///
/// `last_heartbeat` is the most recent online timestamp from the external
/// driver source, mapped onto the monotonic clock at ingest.
#[derive(Debug, Clone)]
pub struct Driver {
    pub id: String,
    /// None when the source returned no usable coordinates.
    pub position: Option<Position>,
    pub active: bool,
    pub last_heartbeat: Instant,
    /// Count of deliveries currently assigned to this driver.
    pub active_assignments: u32,
    pub preferred_vendors: HashSet<String>,
}

impl Driver {
    /// Liveness predicate: active and heartbeat within the window.
    pub fn is_live(&self, now: Instant, liveness_window: std::time::Duration) -> bool {
        self.active && now.duration_since(self.last_heartbeat) <= liveness_window
    }
}

/// 30-day performance aggregate for one driver.
///
/// Raw sums and counts; derived rates handle missing data explicitly so the
/// matcher can apply its partial-data defaults.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PerformanceWindow {
    pub success_count: u64,
    pub total_count: u64,
    pub rating_sum: f64,
    pub rating_count: u64,
    pub delivery_minutes_sum: f64,
    pub delivery_minutes_count: u64,
}

impl PerformanceWindow {
    /// Fraction of successful deliveries, or `None` with no history.
    pub fn success_rate(&self) -> Option<f64> {
        if self.total_count == 0 {
            None
        } else {
            Some(self.success_count as f64 / self.total_count as f64)
        }
    }

    /// Mean rating on the 0-5 scale, or `None` with no ratings.
    pub fn avg_rating(&self) -> Option<f64> {
        if self.rating_count == 0 {
            None
        } else {
            Some(self.rating_sum / self.rating_count as f64)
        }
    }

    /// Mean delivery duration in minutes, or `None` with no samples.
    pub fn avg_delivery_minutes(&self) -> Option<f64> {
        if self.delivery_minutes_count == 0 {
            None
        } else {
            Some(self.delivery_minutes_sum / self.delivery_minutes_count as f64)
        }
    }

    /// True when the window holds no samples at all.
    pub fn is_empty(&self) -> bool {
        self.total_count == 0 && self.rating_count == 0 && self.delivery_minutes_count == 0
    }
}

/// Order lifecycle states visible to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Placed,
    Accepted,
    DriverPending,
    Dispatched,
    Delivered,
    Cancelled,
}

/// An order awaiting dispatch. The core only reads these fields.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: String,
    pub vendor_id: String,
    pub vendor_position: Position,
    /// The customer who placed the order.
    pub customer_id: String,
    pub total_amount: f64,
    pub status: OrderStatus,
}

/// Customer delivery preferences loaded before ranking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerPrefs {
    pub preferred: Vec<String>,
    pub blocked: Vec<String>,
}
