//! Recommender
//!
//! Turns aggregated usage history into per-container resource
//! recommendations and, for MPAs with metric goals, a desired replica count.
//! Results are written to the MPA status; the aggregated history is
//! persisted as checkpoints.

pub mod checkpoint;
pub mod estimator;
pub mod feeder;
pub mod horizontal;
pub mod pod;
pub mod replicas;
mod routine;

#[cfg(test)]
mod tests;

pub use checkpoint::CheckpointWriter;
pub use feeder::{serves, ClusterStateFeeder, SampleStats, DEFAULT_RECOMMENDER_NAME};
pub use horizontal::HorizontalController;
pub use pod::{EstimatorConfig, PodResourceRecommender};
pub use replicas::ReplicaCalculator;
pub use routine::{Recommender, RecommenderConfig};
