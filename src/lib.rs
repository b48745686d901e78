//! scanrel - progressive geospatial scan and tile-streaming core.
//!
//! Incrementally scans a geodetic region for elevation data in
//! coarse-to-fine passes, caches every result durably and resumably, and
//! streams partial results to live viewer sessions as the scan runs.

pub mod broker;
pub mod bus;
pub mod cache;
pub mod config;
pub mod controller;
pub mod elevation;
pub mod error;
pub mod executor;
pub mod log_format;
pub mod metrics;
pub mod model;
pub mod region;
pub mod schedule;
pub mod snapshot;
pub mod web;

pub use config::Config;
pub use controller::TaskController;
pub use error::ScanError;
