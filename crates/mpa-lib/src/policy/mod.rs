//! Resource policies and recommendation capping
//!
//! Container policies come from the MPA spec. The entry named after a
//! container wins over the `*` entry. Capping happens in two places:
//! the recommender applies the MPA's own min/max bounds, and the admission
//! controller and updater additionally fit the result into the namespace's
//! limit ranges for a concrete pod.

mod capping;
mod limit_range;

#[cfg(test)]
mod tests;

pub use capping::{
    apply_container_limit_range, apply_pod_limit_range, boundary_request, cap_recommendation,
    container_requests_and_limits, proportional_limit, CappingAnnotations, CappingProcessor,
};
pub use limit_range::{merge_limit_range_items, LimitRangeCalculator, LimitRangeItems};

use crate::crd::{
    ContainerControlledValues, ContainerResourcePolicy, ContainerScalingMode,
    RecommendedContainerResources, RecommendedPodResources, DEFAULT_CONTAINER_POLICY,
};
use crate::models::{ResourceName, Resources};
use crate::quantity::{resources_from_list, resources_to_list};

/// Policy for `container`: its own entry, else the `*` entry
pub fn container_policy<'a>(
    container: &str,
    policies: &'a [ContainerResourcePolicy],
) -> Option<&'a ContainerResourcePolicy> {
    let mut default = None;
    for policy in policies {
        match policy.container_name.as_deref() {
            Some(name) if name == container => return Some(policy),
            Some(DEFAULT_CONTAINER_POLICY) => default = Some(policy),
            _ => {}
        }
    }
    default
}

pub fn scaling_mode(container: &str, policies: &[ContainerResourcePolicy]) -> ContainerScalingMode {
    container_policy(container, policies)
        .map(|p| p.scaling_mode())
        .unwrap_or_default()
}

pub fn controlled_values(
    container: &str,
    policies: &[ContainerResourcePolicy],
) -> ContainerControlledValues {
    container_policy(container, policies)
        .map(|p| p.controlled_values())
        .unwrap_or_default()
}

pub fn is_controlled(
    container: &str,
    resource: ResourceName,
    policies: &[ContainerResourcePolicy],
) -> bool {
    container_policy(container, policies).map_or(true, |p| p.controls(resource))
}

/// One container's recommendation in integer amounts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecommendationBounds {
    pub container_name: String,
    pub target: Resources,
    pub lower_bound: Resources,
    pub upper_bound: Resources,
    pub uncapped_target: Resources,
}

impl RecommendationBounds {
    /// The three capped fields, target first
    pub fn capped_fields_mut(&mut self) -> [&mut Resources; 3] {
        [
            &mut self.target,
            &mut self.lower_bound,
            &mut self.upper_bound,
        ]
    }
}

impl From<&RecommendedContainerResources> for RecommendationBounds {
    fn from(rec: &RecommendedContainerResources) -> Self {
        Self {
            container_name: rec.container_name.clone(),
            target: resources_from_list(&rec.target),
            lower_bound: resources_from_list(&rec.lower_bound),
            upper_bound: resources_from_list(&rec.upper_bound),
            uncapped_target: resources_from_list(&rec.uncapped_target),
        }
    }
}

impl From<&RecommendationBounds> for RecommendedContainerResources {
    fn from(bounds: &RecommendationBounds) -> Self {
        Self {
            container_name: bounds.container_name.clone(),
            target: resources_to_list(&bounds.target),
            lower_bound: resources_to_list(&bounds.lower_bound),
            upper_bound: resources_to_list(&bounds.upper_bound),
            uncapped_target: resources_to_list(&bounds.uncapped_target),
        }
    }
}

/// Raises and lowers amounts into the policy's allowed range.
/// Returns one annotation per adjusted resource.
pub fn cap_to_policy(resources: &mut Resources, policy: &ContainerResourcePolicy) -> Vec<String> {
    let min = resources_from_list(&policy.min_allowed);
    let max = resources_from_list(&policy.max_allowed);
    let mut annotations = Vec::new();
    for (resource, amount) in resources.iter_mut() {
        if let Some(&lowest) = min.get(resource) {
            if *amount < lowest {
                *amount = lowest;
                annotations.push(format!("{} capped to minAllowed", resource));
            }
        }
        if let Some(&highest) = max.get(resource) {
            if *amount > highest {
                *amount = highest;
                annotations.push(format!("{} capped to maxAllowed", resource));
            }
        }
    }
    annotations
}

fn retain_controlled(resources: &mut Resources, policy: Option<&ContainerResourcePolicy>) {
    if let Some(policy) = policy {
        resources.retain(|r, _| policy.controls(*r));
    }
}

/// Applies the MPA's resource policy to a recommendation: drops containers
/// whose scaling mode is Off, drops uncontrolled resources and fits the
/// target and bounds into `[minAllowed, maxAllowed]`.
///
/// The uncapped target is left as it was.
pub fn apply_mpa_policy_to_bounds(
    bounds: &[RecommendationBounds],
    policies: &[ContainerResourcePolicy],
) -> (Vec<RecommendationBounds>, CappingAnnotations) {
    let mut out = Vec::with_capacity(bounds.len());
    let mut annotations = CappingAnnotations::new();
    for container in bounds {
        let policy = container_policy(&container.container_name, policies);
        if policy.map(|p| p.scaling_mode()) == Some(ContainerScalingMode::Off) {
            continue;
        }
        let mut capped = container.clone();
        retain_controlled(&mut capped.uncapped_target, policy);
        for (i, field) in capped.capped_fields_mut().into_iter().enumerate() {
            retain_controlled(field, policy);
            if let Some(policy) = policy {
                let notes = cap_to_policy(field, policy);
                if i == 0 && !notes.is_empty() {
                    annotations
                        .entry(container.container_name.clone())
                        .or_default()
                        .extend(notes);
                }
            }
        }
        out.push(capped);
    }
    (out, annotations)
}

/// [`apply_mpa_policy_to_bounds`] over the status representation
pub fn apply_mpa_policy(
    recommendation: &RecommendedPodResources,
    policies: &[ContainerResourcePolicy],
) -> RecommendedPodResources {
    let bounds: Vec<RecommendationBounds> = recommendation
        .container_recommendations
        .iter()
        .map(RecommendationBounds::from)
        .collect();
    let (capped, _) = apply_mpa_policy_to_bounds(&bounds, policies);
    RecommendedPodResources {
        container_recommendations: capped.iter().map(RecommendedContainerResources::from).collect(),
    }
}
