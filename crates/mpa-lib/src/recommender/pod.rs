use serde::Deserialize;

use super::estimator::{
    confidence, ConfidenceMultiplier, MarginEstimator, MinResourcesEstimator, PercentileEstimator,
    ResourceEstimator,
};
use crate::crd::{ContainerResourcePolicy, RecommendedContainerResources, RecommendedPodResources};
use crate::model::{AggregateContainerState, ContainerNameToAggregateStateMap};
use crate::models::{cpu_amount_from_cores, memory_amount_from_bytes, ResourceName, Resources};
use crate::policy::{apply_mpa_policy, RecommendationBounds};

/// Tunables of the vertical recommendation
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EstimatorConfig {
    #[serde(default = "default_safety_margin_fraction")]
    pub safety_margin_fraction: f64,

    /// Minimum CPU of a whole pod, split across its containers
    #[serde(default = "default_pod_min_cpu_millicores")]
    pub pod_min_cpu_millicores: f64,

    /// Minimum memory of a whole pod, split across its containers
    #[serde(default = "default_pod_min_memory_mb")]
    pub pod_min_memory_mb: f64,

    #[serde(default = "default_target_percentile")]
    pub target_cpu_percentile: f64,
}

fn default_safety_margin_fraction() -> f64 {
    0.15
}

fn default_pod_min_cpu_millicores() -> f64 {
    25.0
}

fn default_pod_min_memory_mb() -> f64 {
    250.0
}

fn default_target_percentile() -> f64 {
    0.9
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            safety_margin_fraction: default_safety_margin_fraction(),
            pod_min_cpu_millicores: default_pod_min_cpu_millicores(),
            pod_min_memory_mb: default_pod_min_memory_mb(),
            target_cpu_percentile: default_target_percentile(),
        }
    }
}

const LOWER_BOUND_PERCENTILE: f64 = 0.5;
const UPPER_BOUND_PERCENTILE: f64 = 0.95;

/// Below this confidence (one day of history) a recommendation is flagged
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 1.0;

/// Turns per-container aggregations into target, lower and upper bound
pub struct PodResourceRecommender {
    target: Box<dyn ResourceEstimator>,
    lower_bound: Box<dyn ResourceEstimator>,
    upper_bound: Box<dyn ResourceEstimator>,
    pod_min_cpu_millicores: f64,
    pod_min_memory_mb: f64,
}

impl PodResourceRecommender {
    pub fn new(config: &EstimatorConfig) -> Self {
        let margin = config.safety_margin_fraction;
        let target = MarginEstimator::new(
            margin,
            Box::new(PercentileEstimator::new(
                config.target_cpu_percentile,
                default_target_percentile(),
            )),
        );
        let lower_bound = MarginEstimator::new(
            margin,
            Box::new(PercentileEstimator::new(
                LOWER_BOUND_PERCENTILE,
                LOWER_BOUND_PERCENTILE,
            )),
        );
        let upper_bound = MarginEstimator::new(
            margin,
            Box::new(PercentileEstimator::new(
                UPPER_BOUND_PERCENTILE,
                UPPER_BOUND_PERCENTILE,
            )),
        );
        Self {
            target: Box::new(target),
            // Quickly approaches 1 as history grows.
            lower_bound: Box::new(ConfidenceMultiplier::new(0.001, -2.0, Box::new(lower_bound))),
            // (1 + 1/days of history): cautious about reclaiming on short history.
            upper_bound: Box::new(ConfidenceMultiplier::new(1.0, 1.0, Box::new(upper_bound))),
            pod_min_cpu_millicores: config.pod_min_cpu_millicores,
            pod_min_memory_mb: config.pod_min_memory_mb,
        }
    }

    /// Per-container floor: the pod minimum split evenly
    fn min_resources(&self, containers: usize) -> Resources {
        let fraction = 1.0 / containers as f64;
        Resources::from([
            (
                ResourceName::Cpu,
                cpu_amount_from_cores(self.pod_min_cpu_millicores * 0.001 * fraction),
            ),
            (
                ResourceName::Memory,
                memory_amount_from_bytes(self.pod_min_memory_mb * 1024.0 * 1024.0 * fraction),
            ),
        ])
    }

    fn estimate_container(
        &self,
        name: &str,
        state: &AggregateContainerState,
        min: &Resources,
    ) -> RecommendationBounds {
        let target = MinResourcesEstimator::new(min, self.target.as_ref()).estimate(state);
        RecommendationBounds {
            container_name: name.to_string(),
            uncapped_target: target.clone(),
            target,
            lower_bound: MinResourcesEstimator::new(min, self.lower_bound.as_ref()).estimate(state),
            upper_bound: MinResourcesEstimator::new(min, self.upper_bound.as_ref()).estimate(state),
        }
    }

    /// Recommendations sorted by container name
    pub fn recommend(&self, states: &ContainerNameToAggregateStateMap) -> Vec<RecommendationBounds> {
        if states.is_empty() {
            return Vec::new();
        }
        let min = self.min_resources(states.len());
        states
            .iter()
            .map(|(name, state)| self.estimate_container(name, state, &min))
            .collect()
    }
}

/// Whether any container of the MPA has less than a day of history
pub fn has_low_confidence(states: &ContainerNameToAggregateStateMap) -> bool {
    states
        .values()
        .any(|state| confidence(state) < LOW_CONFIDENCE_THRESHOLD)
}

/// Status representation of the recommendation with the MPA's own policy
/// applied. The uncapped target keeps the raw estimate.
pub fn capped_recommendation(
    bounds: &[RecommendationBounds],
    policies: &[ContainerResourcePolicy],
) -> RecommendedPodResources {
    let recommendation = RecommendedPodResources {
        container_recommendations: bounds.iter().map(RecommendedContainerResources::from).collect(),
    };
    apply_mpa_policy(&recommendation, policies)
}
