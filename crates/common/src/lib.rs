#![deny(missing_docs)]

//! Shared configuration, error types, IDs, and observability primitives for
//! Quarry crates.
//!
//! Architecture role:
//! - defines per-query options passed across layers
//! - provides common [`QuarryError`] / [`Result`] contracts
//! - hosts the metrics registry used by the scheduler and membership tracker
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

/// Per-query scheduling options and replica-preference types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::{QueryOptions, ReplicaPreference};
pub use error::{QuarryError, Result};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};
