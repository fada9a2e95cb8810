//! In-memory cluster model fed by informers and the metrics source
//!
//! Usage samples land on a container, which forwards them to the
//! aggregation shared by all containers with the same name and pod labels.
//! MPAs link to every aggregation their selector matches.

mod aggregate;
mod aggregations;
mod cluster;
mod container;
mod mpa;


pub use aggregate::{AggregateContainerState, ContainerNameToAggregateStateMap, HistogramLayout};
pub use aggregations::{AggregationsConfig, EPSILON, MIN_SAMPLE_WEIGHT};
pub use cluster::{ClusterState, PodPhase, PodState, RECOMMENDATION_MISSING_MAX_DURATION};
pub use container::ContainerState;
pub use mpa::Mpa;
