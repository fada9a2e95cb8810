//! Updater
//!
//! Applies the recommender's results to running workloads: desired replica
//! counts go to the target's scale sub-resource, resource recommendations
//! reach pods through in-place resize or eviction. Evictions respect a
//! per-group disruption budget and a global token-bucket rate limit.

pub mod priority;
pub mod rate_limit;
pub mod resize;
pub mod restriction;
mod routine;

#[cfg(test)]
mod tests;

pub use priority::{pod_priority, PodPriority, UpdatePriorityCalculator};
pub use rate_limit::EvictionRateLimiter;
pub use resize::ResizeTracker;
pub use restriction::{eviction_tolerance, EvictionRestriction, EvictionRestrictionFactory};
pub use routine::{Updater, UpdaterConfig};
