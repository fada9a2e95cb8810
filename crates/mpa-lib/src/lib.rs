//! Multidimensional Pod Autoscaler library
//!
//! This crate provides the core functionality for:
//! - The MPA and checkpoint custom resources
//! - Decaying usage histograms and the in-memory cluster model
//! - Vertical and horizontal recommendations
//! - The updater (scale writes, in-place resize, eviction)
//! - The mutating/validating admission webhook
//! - Health checks and observability

pub mod admission;
pub mod client;
pub mod crd;
pub mod error;
pub mod features;
pub mod health;
pub mod histogram;
pub mod lease;
pub mod model;
pub mod models;
pub mod observability;
pub mod policy;
pub mod quantity;
pub mod recommender;
pub mod retry;
pub mod target;
pub mod updater;

#[cfg(test)]
mod testutil;

pub use error::{Error, Result};
pub use features::FeatureGates;
pub use health::{HealthRegistry, HealthReport, LoopHealth, LoopStatus, Readiness};
pub use models::*;
pub use observability::{MpaMetrics, StructuredLogger};
