//! Caching layer.
//!
//! Two pieces, composed rather than inherited:
//!
//! - [`TtlCache`] — plain key-value store with per-entry TTL and lazy
//!   expiration.
//! - [`AdaptiveCache`] — wraps a `TtlCache` with per-key access telemetry
//!   and computes a smart TTL from recent access frequency and hit rate.

mod adaptive;
mod store;

pub use adaptive::{AdaptiveCache, PreloadEntry, ACCESS_LOG_MAX, ACCESS_LOG_TRIM};
pub use store::{CacheStats, TtlCache};
