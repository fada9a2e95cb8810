use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, LimitRangeItem};
use tracing::debug;

use super::limit_range::{LimitRangeCalculator, LimitRangeItems};
use super::{apply_mpa_policy_to_bounds, RecommendationBounds};
use crate::crd::{ContainerResourcePolicy, RecommendedContainerResources, RecommendedPodResources};
use crate::error::Result;
use crate::models::{ResourceAmount, ResourceName, Resources};
use crate::quantity::resources_from_list;

/// Human-readable capping notes keyed by container name
pub type CappingAnnotations = BTreeMap<String, Vec<String>>;

fn non_zero(amount: Option<ResourceAmount>) -> Option<ResourceAmount> {
    amount.filter(|a| a.0 != 0)
}

/// `value * to / from` in 128-bit arithmetic. The flag is set when the result
/// had to be clamped to the largest representable amount.
fn scale_proportionally(
    value: ResourceAmount,
    from: ResourceAmount,
    to: ResourceAmount,
) -> (ResourceAmount, bool) {
    if from.0 == 0 {
        return (value, false);
    }
    let scaled = value.0 as i128 * to.0 as i128 / from.0 as i128;
    if scaled > i64::MAX as i128 {
        (ResourceAmount::MAX, true)
    } else {
        (ResourceAmount(scaled.max(0) as i64), false)
    }
}

/// Request corresponding to a limit-range boundary on limits, keeping the
/// container's request-to-limit ratio.
///
/// No boundary applies when the container has no limit and the range no
/// default limit. A container with a limit but no request gets the
/// boundary itself, as the API server would default the request to the limit.
pub fn boundary_request(
    original_request: Option<ResourceAmount>,
    original_limit: Option<ResourceAmount>,
    boundary_limit: Option<ResourceAmount>,
    default_limit: Option<ResourceAmount>,
) -> Option<ResourceAmount> {
    let boundary = non_zero(boundary_limit)?;
    let limit = non_zero(original_limit).or(non_zero(default_limit))?;
    match non_zero(original_request) {
        None => Some(boundary),
        Some(request) => Some(scale_proportionally(request, limit, boundary).0),
    }
}

/// Limit that keeps the original limit-to-request ratio for a new request.
///
/// Returns `None` when no limit was set (directly or by a limit-range
/// default). The second value is an annotation when the limit overflowed.
pub fn proportional_limit(
    original_limit: Option<ResourceAmount>,
    original_request: Option<ResourceAmount>,
    recommended_request: ResourceAmount,
    default_limit: Option<ResourceAmount>,
) -> (Option<ResourceAmount>, Option<String>) {
    let Some(limit) = non_zero(original_limit).or(non_zero(default_limit)) else {
        return (None, None);
    };
    let Some(request) = non_zero(original_request) else {
        return (Some(recommended_request), None);
    };
    if recommended_request.0 == 0 {
        return (None, None);
    }
    let (scaled, capped) = scale_proportionally(limit, request, recommended_request);
    let note = capped.then(|| "limit capped to fit the largest representable amount".to_string());
    (Some(scaled), note)
}

/// Requests and limits declared on a container, CPU and memory only
pub fn container_requests_and_limits(container: &Container) -> (Resources, Resources) {
    let resources = container.resources.as_ref();
    let requests = resources
        .and_then(|r| r.requests.as_ref())
        .map(resources_from_list)
        .unwrap_or_default();
    let limits = resources
        .and_then(|r| r.limits.as_ref())
        .map(resources_from_list)
        .unwrap_or_default();
    (requests, limits)
}

fn item_list(list: &Option<BTreeMap<String, k8s_openapi::apimachinery::pkg::api::resource::Quantity>>) -> Resources {
    list.as_ref().map(resources_from_list).unwrap_or_default()
}

/// Fits `recommendation` into a container limit-range item: raised to the
/// request matching `min`, then lowered to the request matching `max`.
pub fn apply_container_limit_range(
    recommendation: &mut Resources,
    container: &Container,
    item: &LimitRangeItem,
) -> Vec<String> {
    let (requests, limits) = container_requests_and_limits(container);
    let max = item_list(&item.max);
    let min = item_list(&item.min);
    let default = item_list(&item.default);
    let mut notes = Vec::new();

    for (resource, amount) in recommendation.iter_mut() {
        let boundary = |list: &Resources| {
            boundary_request(
                requests.get(resource).copied(),
                limits.get(resource).copied(),
                list.get(resource).copied(),
                default.get(resource).copied(),
            )
        };
        if let Some(lowest) = boundary(&min) {
            if *amount < lowest {
                *amount = lowest;
                notes.push(format!("{} capped to fit Min in container LimitRange", resource));
            }
        }
        if let Some(highest) = boundary(&max) {
            if *amount > highest {
                *amount = highest;
                notes.push(format!("{} capped to fit Max in container LimitRange", resource));
            }
        }
    }
    notes
}

/// Fits the sum over a pod's containers into a pod limit-range item for one
/// resource. `fields` pairs each recommended amount with the container it
/// belongs to.
pub fn apply_pod_limit_range(
    fields: &mut [(&Container, &mut Resources)],
    item: &LimitRangeItem,
    resource: ResourceName,
) {
    let min = item_list(&item.min).get(&resource).copied().unwrap_or_default();
    let max = item_list(&item.max).get(&resource).copied();

    let limit_for = |container: &Container, recommended: ResourceAmount| {
        let (requests, limits) = container_requests_and_limits(container);
        proportional_limit(
            limits.get(&resource).copied(),
            requests.get(&resource).copied(),
            recommended,
            None,
        )
        .0
    };

    let mut sum_limit = ResourceAmount::ZERO;
    let mut sum_recommendation = ResourceAmount::ZERO;
    for (container, recommendation) in fields.iter() {
        let recommended = recommendation.get(&resource).copied().unwrap_or_default();
        if let Some(limit) = limit_for(container, recommended) {
            sum_limit = sum_limit.saturating_add(limit);
        }
        sum_recommendation = sum_recommendation.saturating_add(recommended);
    }

    let within_max = max.map_or(true, |m| m.0 == 0 || m >= sum_limit);
    if min <= sum_limit && min <= sum_recommendation && within_max {
        return;
    }

    if min > sum_recommendation && sum_limit.0 != 0 {
        for (_, recommendation) in fields.iter_mut() {
            if let Some(amount) = recommendation.get_mut(&resource) {
                *amount = scale_proportionally(*amount, sum_recommendation, min).0;
            }
        }
        return;
    }

    if sum_limit.0 == 0 {
        return;
    }
    let mut target_total = ResourceAmount::ZERO;
    if min > sum_limit {
        target_total = min;
    }
    if let Some(max) = max.filter(|m| m.0 != 0 && *m < sum_limit) {
        target_total = max;
    }
    for (container, recommendation) in fields.iter_mut() {
        let Some(amount) = recommendation.get_mut(&resource) else {
            continue;
        };
        if limit_for(container, *amount).is_none() {
            continue;
        }
        *amount = scale_proportionally(*amount, sum_limit, target_total).0;
    }
}

fn find_container<'a>(containers: &'a [Container], name: &str) -> Option<&'a Container> {
    containers.iter().find(|c| c.name == name)
}

/// Caps a recommendation for a concrete pod: the MPA policy first, then the
/// container limit range, then the pod limit range.
///
/// Recommendations for containers not in `containers` are dropped.
pub fn cap_recommendation(
    recommendation: &RecommendedPodResources,
    policies: &[ContainerResourcePolicy],
    containers: &[Container],
    limits: &LimitRangeItems,
) -> (RecommendedPodResources, CappingAnnotations) {
    let bounds: Vec<RecommendationBounds> = recommendation
        .container_recommendations
        .iter()
        .filter(|r| {
            let present = find_container(containers, &r.container_name).is_some();
            if !present {
                debug!(container = %r.container_name, "No matching container in pod");
            }
            present
        })
        .map(RecommendationBounds::from)
        .collect();

    let (mut capped, mut annotations) = apply_mpa_policy_to_bounds(&bounds, policies);

    if let Some(item) = &limits.container {
        for bounds in capped.iter_mut() {
            let Some(container) = find_container(containers, &bounds.container_name) else {
                continue;
            };
            let name = bounds.container_name.clone();
            for (i, field) in bounds.capped_fields_mut().into_iter().enumerate() {
                let notes = apply_container_limit_range(field, container, item);
                if i == 0 && !notes.is_empty() {
                    annotations.entry(name.clone()).or_default().extend(notes);
                }
            }
        }
    }

    if let Some(item) = &limits.pod {
        for field_index in 0..3 {
            for resource in ResourceName::ALL {
                let mut fields: Vec<(&Container, &mut Resources)> = capped
                    .iter_mut()
                    .filter_map(|b| {
                        let container = find_container(containers, &b.container_name)?;
                        let [target, lower, upper] = b.capped_fields_mut();
                        let field = match field_index {
                            0 => target,
                            1 => lower,
                            _ => upper,
                        };
                        Some((container, field))
                    })
                    .collect();
                apply_pod_limit_range(&mut fields, item, resource);
            }
        }
    }

    let capped = RecommendedPodResources {
        container_recommendations: capped.iter().map(RecommendedContainerResources::from).collect(),
    };
    (capped, annotations)
}

/// Caps recommendations against the live limit ranges of the pod's namespace
#[derive(Clone)]
pub struct CappingProcessor {
    limits: LimitRangeCalculator,
}

impl CappingProcessor {
    pub fn new(limits: LimitRangeCalculator) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &LimitRangeCalculator {
        &self.limits
    }

    pub async fn apply(
        &self,
        recommendation: &RecommendedPodResources,
        policies: &[ContainerResourcePolicy],
        namespace: &str,
        containers: &[Container],
    ) -> Result<(RecommendedPodResources, CappingAnnotations, LimitRangeItems)> {
        let items = self.limits.items(namespace).await?;
        let (capped, annotations) = cap_recommendation(recommendation, policies, containers, &items);
        Ok((capped, annotations, items))
    }
}
