//! fleetmatch — core dispatch engine for an on-demand delivery platform.
//!
//! Receives an order, locates eligible couriers through a grid-bucketed
//! spatial index, scores them with a weighted multi-factor matcher, and
//! keeps the service healthy under load with an adaptive cache, circuit
//! breakers, resource admission, threat-aware activity scoring, and a
//! background job scheduler.
//!
//! # High-Level API
//!
//! The [`dispatch`] module provides the composed service:
//!
//! ```ignore
//! use fleetmatch::config::Settings;
//! use fleetmatch::dispatch::{DispatchContext, Dispatcher};
//!
//! let dispatcher = Dispatcher::builder(Settings::default())
//!     .audit_sink(sink)
//!     .driver_source(drivers)
//!     // ... remaining collaborators ...
//!     .build()?;
//!
//! let outcome = dispatcher.dispatch(&order, &DispatchContext::now()).await?;
//! ```
//!
//! Everything external — driver population, rollup stores, notification
//! backends, the audit log — enters through the thin traits in [`stores`].

pub mod admission;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod geo;
pub mod logging;
pub mod matcher;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod scheduler;
pub mod spatial;
pub mod stores;
pub mod threat;

pub use error::DispatchError;

/// Version of the fleetmatch library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
