//! Update priority of running pods
//!
//! A pod is worth updating when its requests fall outside the recommended
//! range, when they drift far enough from the target on a long-lived pod, or
//! right after an early OOM kill that the recommendation addresses.

use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::debug;

use crate::admission::observed_containers;
use crate::crd::{ChangeRequirement, EvictionRequirement, RecommendedPodResources};
use crate::models::{ResourceAmount, ResourceName, Resources};
use crate::policy::container_requests_and_limits;
use crate::quantity::resources_from_list;

/// Relative change below which an in-range pod is left alone
pub const MIN_CHANGE_PRIORITY: f64 = 0.1;
/// Pods younger than this are only updated when outside the range
pub const POD_LIFETIME_UPDATE_THRESHOLD: Duration = Duration::hours(12);
/// An OOM kill this soon after container start marks a quick OOM
pub const QUICK_OOM_THRESHOLD: Duration = Duration::minutes(10);

const OOM_KILLED: &str = "OOMKilled";

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PodPriority {
    /// Some container requests fall below the lower or above the upper bound
    pub outside_recommended_range: bool,
    /// Sum over resources of |recommended - requested| / requested
    pub resource_diff: f64,
    pub scale_up: bool,
}

impl PodPriority {
    /// Orders pods so that the most urgent update comes first
    pub fn urgency(&self, other: &PodPriority) -> Ordering {
        other
            .outside_recommended_range
            .cmp(&self.outside_recommended_range)
            .then_with(|| {
                other
                    .resource_diff
                    .partial_cmp(&self.resource_diff)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| other.scale_up.cmp(&self.scale_up))
    }
}

fn find_recommendation<'a>(
    recommendation: &'a RecommendedPodResources,
    container: &str,
) -> Option<&'a crate::crd::RecommendedContainerResources> {
    recommendation
        .container_recommendations
        .iter()
        .find(|r| r.container_name == container)
}

/// Priority of updating `pod` to `recommendation`. Containers left out of the
/// observed-containers annotation are skipped.
pub fn pod_priority(pod: &Pod, recommendation: &RecommendedPodResources) -> PodPriority {
    let observed = observed_containers(pod);
    let mut outside = false;
    let mut requested = Resources::new();
    let mut recommended = Resources::new();

    for container in pod.spec.iter().flat_map(|s| s.containers.iter()) {
        if observed
            .as_ref()
            .map_or(false, |names| !names.iter().any(|n| *n == container.name))
        {
            continue;
        }
        let Some(rec) = find_recommendation(recommendation, &container.name) else {
            continue;
        };
        let (requests, _) = container_requests_and_limits(container);
        let target = resources_from_list(&rec.target);
        let lower = resources_from_list(&rec.lower_bound);
        let upper = resources_from_list(&rec.upper_bound);

        for resource in ResourceName::ALL {
            let Some(goal) = target.get(&resource) else {
                continue;
            };
            let request = requests.get(&resource).copied();
            let total_requested = requested.entry(resource).or_insert(ResourceAmount::ZERO);
            *total_requested = total_requested.saturating_add(request.unwrap_or_default());
            let total_recommended = recommended.entry(resource).or_insert(ResourceAmount::ZERO);
            *total_recommended = total_recommended.saturating_add(*goal);

            let below = lower
                .get(&resource)
                .zip(request)
                .map_or(false, |(lo, req)| req < *lo);
            let above = upper
                .get(&resource)
                .zip(request)
                .map_or(false, |(hi, req)| req > *hi);
            if request.is_none() || below || above {
                outside = true;
            }
        }
    }

    let mut resource_diff = 0.0;
    let mut net_change = 0.0;
    for (resource, request) in &requested {
        if request.value() == 0 {
            continue;
        }
        let goal = recommended.get(resource).copied().unwrap_or_default();
        let relative = (goal.value() - request.value()) as f64 / request.value() as f64;
        resource_diff += relative.abs();
        net_change += relative;
    }

    PodPriority {
        outside_recommended_range: outside,
        resource_diff,
        scale_up: net_change > 0.0,
    }
}

fn pod_start(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.status
        .as_ref()
        .and_then(|s| s.start_time.as_ref())
        .or(pod.metadata.creation_timestamp.as_ref())
        .map(|t| t.0)
}

/// A container was OOM-killed within [`QUICK_OOM_THRESHOLD`] of starting and
/// the recommendation raises its memory
pub fn has_quick_oom(pod: &Pod, recommendation: &RecommendedPodResources) -> bool {
    let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) else {
        return false;
    };
    for status in statuses {
        let Some(terminated) = status.last_state.as_ref().and_then(|s| s.terminated.as_ref()) else {
            continue;
        };
        if terminated.reason.as_deref() != Some(OOM_KILLED) {
            continue;
        }
        let (Some(started), Some(finished)) = (&terminated.started_at, &terminated.finished_at)
        else {
            continue;
        };
        if finished.0 - started.0 >= QUICK_OOM_THRESHOLD {
            continue;
        }
        let Some(container) = pod
            .spec
            .iter()
            .flat_map(|s| s.containers.iter())
            .find(|c| c.name == status.name)
        else {
            continue;
        };
        let Some(rec) = find_recommendation(recommendation, &container.name) else {
            continue;
        };
        let (requests, _) = container_requests_and_limits(container);
        let target = resources_from_list(&rec.target);
        if let (Some(goal), Some(request)) = (
            target.get(&ResourceName::Memory),
            requests.get(&ResourceName::Memory),
        ) {
            if goal > request {
                return true;
            }
        }
    }
    false
}

fn container_satisfies(
    requests: &Resources,
    target: &Resources,
    requirements: &[EvictionRequirement],
) -> bool {
    requirements.iter().all(|requirement| {
        requirement.resources.iter().all(|name| {
            let Some(resource) = ResourceName::parse(name) else {
                return false;
            };
            let (Some(request), Some(goal)) = (requests.get(&resource), target.get(&resource))
            else {
                return false;
            };
            match requirement.change_requirement {
                ChangeRequirement::TargetHigherThanRequests => goal > request,
                ChangeRequirement::TargetLowerThanRequests => goal < request,
            }
        })
    })
}

/// True when some container of the pod meets every eviction requirement
pub fn meets_eviction_requirements(
    pod: &Pod,
    recommendation: &RecommendedPodResources,
    requirements: &[EvictionRequirement],
) -> bool {
    if requirements.is_empty() {
        return true;
    }
    pod.spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .any(|container| {
            let Some(rec) = find_recommendation(recommendation, &container.name) else {
                return false;
            };
            let (requests, _) = container_requests_and_limits(container);
            container_satisfies(&requests, &resources_from_list(&rec.target), requirements)
        })
}

struct PrioritizedPod {
    pod: Pod,
    priority: PodPriority,
}

/// Collects the update candidates of one MPA
pub struct UpdatePriorityCalculator<'a> {
    requirements: &'a [EvictionRequirement],
    pods: Vec<PrioritizedPod>,
}

impl<'a> UpdatePriorityCalculator<'a> {
    pub fn new(requirements: &'a [EvictionRequirement]) -> Self {
        Self {
            requirements,
            pods: Vec::new(),
        }
    }

    /// Considers `pod` against its processed recommendation. Pods that do not
    /// need an update are dropped.
    pub fn add_pod(&mut self, pod: &Pod, recommendation: &RecommendedPodResources, now: DateTime<Utc>) {
        let priority = pod_priority(pod, recommendation);
        let quick_oom = has_quick_oom(pod, recommendation);

        if !priority.outside_recommended_range && !quick_oom {
            let young = pod_start(pod).map_or(true, |start| now - start < POD_LIFETIME_UPDATE_THRESHOLD);
            if young {
                debug!(pod = %pod.name_any(), "Not updating a short-lived pod, request within range");
                return;
            }
            if priority.resource_diff < MIN_CHANGE_PRIORITY {
                debug!(
                    pod = %pod.name_any(),
                    resource_diff = priority.resource_diff,
                    "Not updating pod, resource diff too low"
                );
                return;
            }
        }

        if !meets_eviction_requirements(pod, recommendation, self.requirements) {
            debug!(pod = %pod.name_any(), "Pod does not meet the eviction requirements");
            return;
        }
        self.pods.push(PrioritizedPod {
            pod: pod.clone(),
            priority,
        });
    }

    /// Candidates, most urgent first
    pub fn sorted_pods(mut self) -> Vec<Pod> {
        self.pods.sort_by(|a, b| a.priority.urgency(&b.priority));
        self.pods.into_iter().map(|p| p.pod).collect()
    }
}
