//! Geographic primitives.
//!
//! Great-circle distance and grid-cell keys for the spatial index.
//! Pure functions, no side effects.

use std::fmt;

/// Earth radius used for great-circle distance, in miles.
pub const EARTH_RADIUS_MILES: f64 = 3958.8;

/// Degrees of latitude per mile (approximate, used for bounding boxes).
pub const DEGREES_PER_MILE_LAT: f64 = 1.0 / 69.0;

/// Great-circle distance between two points, in miles.
///
/// Haversine formula over a spherical Earth of radius
/// [`EARTH_RADIUS_MILES`].
#[inline]
pub fn distance_miles(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_MILES * c
}

/// Identifier of a square grid cell.
///
/// A cell is the region `[idx·g, (idx+1)·g)` on each axis for grid size `g`.
/// Keys hash and compare on the integer indices; `Display` renders the
/// canonical corner coordinates to 6 decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellKey {
    lat_idx: i32,
    lon_idx: i32,
    /// Grid size in micro-degrees, kept so the key can render its corner.
    grid_e6: u32,
}

impl CellKey {
    /// Cell containing the given position for grid size `grid_degrees`.
    #[inline]
    pub fn for_position(lat: f64, lon: f64, grid_degrees: f64) -> Self {
        Self::from_indices(
            (lat / grid_degrees).floor() as i32,
            (lon / grid_degrees).floor() as i32,
            grid_degrees,
        )
    }

    /// Cell at explicit integer indices. Used when scanning a bounding box.
    #[inline]
    pub fn from_indices(lat_idx: i32, lon_idx: i32, grid_degrees: f64) -> Self {
        Self {
            lat_idx,
            lon_idx,
            grid_e6: (grid_degrees * 1e6).round() as u32,
        }
    }

    pub fn lat_idx(&self) -> i32 {
        self.lat_idx
    }

    pub fn lon_idx(&self) -> i32 {
        self.lon_idx
    }

    /// The cell's corner coordinates `(idx·g, idx·g)` in degrees.
    pub fn corner(&self) -> (f64, f64) {
        let g = self.grid_e6 as f64 / 1e6;
        (self.lat_idx as f64 * g, self.lon_idx as f64 * g)
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (lat, lon) = self.corner();
        write!(f, "{:.6},{:.6}", lat, lon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_zero_for_same_point() {
        let d = distance_miles(34.05, -118.25, 34.05, -118.25);
        assert!(d.abs() < 1e-9);
    }

    #[test]
    fn test_distance_la_to_sf() {
        // Los Angeles to San Francisco, roughly 347 miles great-circle.
        let d = distance_miles(34.0522, -118.2437, 37.7749, -122.4194);
        assert!((d - 347.0).abs() < 5.0, "expected ~347 mi, got {}", d);
    }

    #[test]
    fn test_distance_one_degree_latitude() {
        // One degree of latitude is about 69 miles everywhere.
        let d = distance_miles(40.0, -74.0, 41.0, -74.0);
        assert!((d - 69.0).abs() < 1.0, "expected ~69 mi, got {}", d);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let ab = distance_miles(34.05, -118.25, 37.77, -122.42);
        let ba = distance_miles(37.77, -122.42, 34.05, -118.25);
        assert!((ab - ba).abs() < 1e-9);
    }

    #[test]
    fn test_cell_key_same_cell() {
        let a = CellKey::for_position(34.051, -118.251, 0.01);
        let b = CellKey::for_position(34.059, -118.259, 0.01);
        assert_eq!(a, b);
    }

    #[test]
    fn test_cell_key_different_cells() {
        let a = CellKey::for_position(34.051, -118.251, 0.01);
        let b = CellKey::for_position(34.061, -118.251, 0.01);
        assert_ne!(a, b);
    }

    #[test]
    fn test_cell_key_display_six_decimals() {
        let key = CellKey::for_position(34.057, -118.253, 0.01);
        assert_eq!(key.to_string(), "34.050000,-118.260000");
    }

    #[test]
    fn test_cell_key_negative_coordinates_floor() {
        // floor(-118.251 / 0.01) = -11826, corner -118.26 (towards -inf).
        let key = CellKey::for_position(-0.005, -118.251, 0.01);
        let (lat, lon) = key.corner();
        assert!((lat - (-0.01)).abs() < 1e-9);
        assert!((lon - (-118.26)).abs() < 1e-9);
    }

    #[test]
    fn test_cell_key_corner_matches_indices() {
        let key = CellKey::from_indices(3405, -11825, 0.01);
        let (lat, lon) = key.corner();
        assert!((lat - 34.05).abs() < 1e-9);
        assert!((lon - (-118.25)).abs() < 1e-9);
    }
}
