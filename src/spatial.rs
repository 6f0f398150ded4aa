//! Spatial index over the live driver population.
//!
//! Drivers are bucketed into fixed-size grid cells keyed by [`CellKey`].
//! Ingest replaces the whole cell map atomically: the new map is built
//! outside the lock and swapped in under a brief write lock, so readers see
//! either the pre- or post-upsert population, never a partial merge.
//!
//! Grid cells give cheap pre-filtering for radius queries without a k-d
//! tree; with the default 0.01° grid and 10-minute liveness window cells
//! stay small.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::geo::{distance_miles, CellKey, DEGREES_PER_MILE_LAT};
use crate::model::Driver;

/// Counts reported by [`SpatialIndex::stats`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SpatialStats {
    pub cells: usize,
    pub drivers: usize,
    pub mean_per_cell: f64,
}

/// Grid-bucketed index of live drivers.
pub struct SpatialIndex {
    grid_degrees: f64,
    liveness: Duration,
    cells: RwLock<HashMap<CellKey, Vec<Driver>>>,
}

impl SpatialIndex {
    pub fn new(grid_degrees: f64, liveness: Duration) -> Self {
        Self {
            grid_degrees,
            liveness,
            cells: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces the indexed population with `drivers`.
    ///
    /// Only drivers with a position that pass the liveness predicate are
    /// indexed; within a cell, insertion order is preserved. Runs
    /// [`gc_stale`](Self::gc_stale) after the swap.
    pub fn upsert_drivers(&self, drivers: Vec<Driver>) {
        let now = Instant::now();
        let mut fresh: HashMap<CellKey, Vec<Driver>> = HashMap::new();

        let total = drivers.len();
        for driver in drivers {
            let Some(position) = driver.position else {
                continue;
            };
            if !driver.is_live(now, self.liveness) {
                continue;
            }
            let key = CellKey::for_position(position.lat, position.lon, self.grid_degrees);
            fresh.entry(key).or_default().push(driver);
        }

        let indexed: usize = fresh.values().map(Vec::len).sum();
        {
            let mut cells = self.cells.write().expect("spatial index lock poisoned");
            *cells = fresh;
        }
        debug!(total, indexed, "spatial index replaced");

        self.gc_stale();
    }

    /// Drops drivers whose heartbeat aged past the liveness window and
    /// deletes cells that become empty. Returns how many drivers were
    /// removed.
    pub fn gc_stale(&self) -> usize {
        let now = Instant::now();
        let mut cells = self.cells.write().expect("spatial index lock poisoned");

        let mut removed = 0;
        cells.retain(|_, drivers| {
            let before = drivers.len();
            drivers.retain(|d| d.is_live(now, self.liveness));
            removed += before - drivers.len();
            !drivers.is_empty()
        });

        if removed > 0 {
            debug!(removed, "spatial index gc dropped stale drivers");
        }
        removed
    }

    /// Drivers within `radius_miles` of the given point, ascending by
    /// distance; ties keep cell insertion order. `radius_miles = 0` matches
    /// only drivers exactly at the query point.
    pub fn near(&self, lat: f64, lon: f64, radius_miles: f64) -> Vec<Driver> {
        let lat_span = radius_miles * DEGREES_PER_MILE_LAT;
        let lon_span = radius_miles
            * DEGREES_PER_MILE_LAT
            / lat.to_radians().cos().abs().max(1e-6);

        let lat_lo = ((lat - lat_span) / self.grid_degrees).floor() as i32;
        let lat_hi = ((lat + lat_span) / self.grid_degrees).floor() as i32;
        let lon_lo = ((lon - lon_span) / self.grid_degrees).floor() as i32;
        let lon_hi = ((lon + lon_span) / self.grid_degrees).floor() as i32;

        let cells = self.cells.read().expect("spatial index lock poisoned");
        let mut seen: HashSet<String> = HashSet::new();
        let mut matched: Vec<(Driver, f64)> = Vec::new();

        for lat_idx in lat_lo..=lat_hi {
            for lon_idx in lon_lo..=lon_hi {
                let key = CellKey::from_indices(lat_idx, lon_idx, self.grid_degrees);
                let Some(drivers) = cells.get(&key) else {
                    continue;
                };
                for driver in drivers {
                    let Some(position) = driver.position else {
                        continue;
                    };
                    let distance = distance_miles(lat, lon, position.lat, position.lon);
                    if distance <= radius_miles && seen.insert(driver.id.clone()) {
                        matched.push((driver.clone(), distance));
                    }
                }
            }
        }
        drop(cells);

        matched.sort_by(|a, b| a.1.partial_cmp(&b.1).expect("distance is never NaN"));
        matched.into_iter().map(|(driver, _)| driver).collect()
    }

    pub fn stats(&self) -> SpatialStats {
        let cells = self.cells.read().expect("spatial index lock poisoned");
        let drivers: usize = cells.values().map(Vec::len).sum();
        SpatialStats {
            cells: cells.len(),
            drivers,
            mean_per_cell: if cells.is_empty() {
                0.0
            } else {
                drivers as f64 / cells.len() as f64
            },
        }
    }

    /// Drops the entire population. Used by emergency cleanup.
    pub fn clear(&self) {
        let mut cells = self.cells.write().expect("spatial index lock poisoned");
        cells.clear();
    }
}
