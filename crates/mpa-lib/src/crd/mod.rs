//! Custom resource definitions owned by the autoscaler
//!
//! Both kinds live in `autoscaling.k8s.io/v1alpha1`:
//! - `MultidimPodAutoscaler` (short name `mpa`) carries operator intent and the
//!   recommender's output in its status
//! - `MultidimPodAutoscalerCheckpoint` (short name `mpacheckpoint`) persists the
//!   aggregated usage histograms of one container of one MPA

mod checkpoint;
mod condition;
mod mpa;

pub use checkpoint::{
    MultidimPodAutoscalerCheckpoint, MultidimPodAutoscalerCheckpointSpec,
    MultidimPodAutoscalerCheckpointStatus, CHECKPOINT_VERSION,
};
pub use condition::{condition_types, set_condition, ConditionStatus, MpaCondition};
pub use mpa::{
    ChangeRequirement, ContainerControlledValues, ContainerResourcePolicy, ContainerScalingMode,
    EvictionRequirement, Goals, MultidimPodAutoscaler, MultidimPodAutoscalerSpec,
    MultidimPodAutoscalerStatus, PodResourcePolicy, PodUpdatePolicy, RecommendedContainerResources,
    RecommendedPodResources, RecommenderSelector, ScaleTargetRef, ScalingConstraints, UpdateMode,
    DEFAULT_CONTAINER_POLICY,
};

/// API group shared by both custom resources
pub const API_GROUP: &str = "autoscaling.k8s.io";

/// Served version of both custom resources
pub const API_VERSION: &str = "v1alpha1";
