use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::error::{Error, Result};
use crate::models::{ContainerMetricsSnapshot, ResourceAmount, ResourceName};
use crate::quantity::resources_from_list;
use crate::target::{pod_labels, Selector};

/// Usage ratios within this distance of 1.0 do not change the replica count
pub const DEFAULT_TOLERANCE: f64 = 0.1;

const CPU_INITIALIZATION_PERIOD: Duration = Duration::minutes(5);
const INITIAL_READINESS_DELAY: Duration = Duration::seconds(30);

/// Per-pod goal of a resource metric
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResourceTarget {
    /// Percent of the pod's request
    Utilization(i32),
    /// Absolute usage per pod
    AverageValue(ResourceAmount),
}

/// Replica count proposed for one metric and the usage it was derived from
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaProposal {
    pub replicas: i32,
    pub utilization: Option<i32>,
    pub average_value: ResourceAmount,
}

#[derive(Default)]
struct PodGroups {
    ready: BTreeMap<String, i64>,
    unready: Vec<String>,
    missing: Vec<String>,
}

fn is_ignored(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
        || pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Failed")
}

fn is_pending(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Pending")
}

/// CPU of freshly started pods is not representative until they are ready
fn cpu_unready(pod: &Pod, now: DateTime<Utc>) -> bool {
    let status = pod.status.as_ref();
    let condition = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Ready"));
    let start = status.and_then(|s| s.start_time.as_ref()).map(|t| t.0);
    let (Some(condition), Some(start)) = (condition, start) else {
        return true;
    };
    if start + CPU_INITIALIZATION_PERIOD > now {
        return condition.status != "True";
    }
    let transition = condition
        .last_transition_time
        .as_ref()
        .map(|t| t.0)
        .unwrap_or(start);
    condition.status == "False" && start + INITIAL_READINESS_DELAY > transition
}

/// Summed request of the selected containers of a pod
fn pod_request(pod: &Pod, resource: ResourceName, container: Option<&str>) -> Result<i64> {
    let mut total = 0;
    for c in pod.spec.iter().flat_map(|s| s.containers.iter()) {
        if container.map_or(false, |name| name != c.name) {
            continue;
        }
        let requests = c
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .map(resources_from_list)
            .unwrap_or_default();
        let request = requests.get(&resource).ok_or_else(|| {
            Error::metrics(format!(
                "missing request for {} in container {} of pod {}",
                resource,
                c.name,
                pod.name_any()
            ))
        })?;
        total += request.0;
    }
    Ok(total)
}

/// Computes replica counts from per-pod resource usage
#[derive(Debug, Clone, Copy)]
pub struct ReplicaCalculator {
    tolerance: f64,
}

impl Default for ReplicaCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE)
    }
}

impl ReplicaCalculator {
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    fn within_tolerance(&self, ratio: f64) -> bool {
        (1.0 - ratio).abs() <= self.tolerance
    }

    /// Usage of `resource` per pod, restricted to `container` when given
    fn pod_usage(
        snapshots: &[ContainerMetricsSnapshot],
        resource: ResourceName,
        container: Option<&str>,
    ) -> BTreeMap<String, i64> {
        let mut usage = BTreeMap::new();
        for snapshot in snapshots {
            if container.map_or(false, |name| name != snapshot.id.container_name) {
                continue;
            }
            let Some(amount) = snapshot.usage.get(&resource) else {
                continue;
            };
            *usage
                .entry(snapshot.id.pod_id.pod_name.clone())
                .or_insert(0) += amount.0;
        }
        usage
    }

    fn group_pods(
        pods: &[&Pod],
        usage: &BTreeMap<String, i64>,
        resource: ResourceName,
        now: DateTime<Utc>,
    ) -> PodGroups {
        let mut groups = PodGroups::default();
        for pod in pods {
            if is_ignored(pod) {
                continue;
            }
            let name = pod.name_any();
            if is_pending(pod) {
                groups.unready.push(name);
                continue;
            }
            let Some(value) = usage.get(&name) else {
                groups.missing.push(name);
                continue;
            };
            if resource == ResourceName::Cpu && cpu_unready(pod, now) {
                groups.unready.push(name);
                continue;
            }
            groups.ready.insert(name, *value);
        }
        groups
    }

    /// Usage ratio against the target, the utilization in percent when the
    /// target is relative, and the average usage per pod
    fn usage_ratio(
        usage: &BTreeMap<String, i64>,
        requests: &BTreeMap<String, i64>,
        target: ResourceTarget,
    ) -> Result<(f64, Option<i32>, ResourceAmount)> {
        let total: i64 = usage.values().sum();
        let average = ResourceAmount(total / usage.len().max(1) as i64);
        match target {
            ResourceTarget::Utilization(goal) => {
                let requested: i64 = usage
                    .keys()
                    .filter_map(|name| requests.get(name))
                    .sum();
                if requested == 0 {
                    return Err(Error::metrics("no requests found for pods with metrics"));
                }
                let utilization = (total * 100 / requested) as i32;
                Ok((utilization as f64 / goal as f64, Some(utilization), average))
            }
            ResourceTarget::AverageValue(goal) => {
                if goal.0 == 0 {
                    return Err(Error::metrics("average value target is zero"));
                }
                Ok((average.0 as f64 / goal.0 as f64, None, average))
            }
        }
    }

    /// Replica count that brings per-pod usage of `resource` to `target`.
    ///
    /// Pods without metrics count as using exactly their target when scaling
    /// down and nothing when scaling up. Unready pods count as using nothing
    /// when scaling up.
    #[allow(clippy::too_many_arguments)]
    pub fn resource_replicas(
        &self,
        current_replicas: i32,
        target: ResourceTarget,
        resource: ResourceName,
        container: Option<&str>,
        pods: &[Pod],
        snapshots: &[ContainerMetricsSnapshot],
        selector: &Selector,
        now: DateTime<Utc>,
    ) -> Result<ReplicaProposal> {
        let selected: Vec<&Pod> = pods
            .iter()
            .filter(|p| selector.matches(&pod_labels(p)))
            .collect();
        if selected.is_empty() {
            return Err(Error::metrics(
                "no pods returned by selector while calculating replica count",
            ));
        }

        let usage = Self::pod_usage(snapshots, resource, container);
        let PodGroups {
            mut ready,
            unready,
            missing,
        } = Self::group_pods(&selected, &usage, resource, now);
        if ready.is_empty() {
            return Err(Error::metrics("did not receive metrics for any ready pods"));
        }

        let mut requests = BTreeMap::new();
        if let ResourceTarget::Utilization(_) = target {
            for pod in selected.iter().filter(|p| !is_ignored(p)) {
                requests.insert(pod.name_any(), pod_request(pod, resource, container)?);
            }
        }

        let (ratio, utilization, average_value) = Self::usage_ratio(&ready, &requests, target)?;
        let proposal = |replicas| ReplicaProposal {
            replicas,
            utilization,
            average_value,
        };

        let rebalance_unready = !unready.is_empty() && ratio > 1.0;
        if !rebalance_unready && missing.is_empty() {
            if self.within_tolerance(ratio) {
                return Ok(proposal(current_replicas));
            }
            return Ok(proposal((ratio * ready.len() as f64).ceil() as i32));
        }

        for name in &missing {
            let assumed = if ratio < 1.0 {
                match target {
                    ResourceTarget::Utilization(_) => requests.get(name).copied().unwrap_or(0),
                    ResourceTarget::AverageValue(goal) => goal.0,
                }
            } else {
                0
            };
            ready.insert(name.clone(), assumed);
        }
        if rebalance_unready {
            for name in &unready {
                ready.insert(name.clone(), 0);
            }
        }

        let (new_ratio, _, _) = Self::usage_ratio(&ready, &requests, target)?;
        if self.within_tolerance(new_ratio)
            || (ratio < 1.0 && new_ratio > 1.0)
            || (ratio > 1.0 && new_ratio < 1.0)
        {
            return Ok(proposal(current_replicas));
        }
        let replicas = (new_ratio * ready.len() as f64).ceil() as i32;
        if (new_ratio < 1.0 && replicas > current_replicas)
            || (new_ratio > 1.0 && replicas < current_replicas)
        {
            return Ok(proposal(current_replicas));
        }
        Ok(proposal(replicas))
    }
}
