//! Horizontal decision: desired replica count from the MPA's metric goals
//!
//! Follows the horizontal pod autoscaler: a proposal per metric, the largest
//! one wins, then stabilization and rate limits are applied. Without a
//! behavior a fixed downscale window and scale-up limit apply. The result is
//! written to the MPA status only; the updater applies it to the target.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::autoscaling::v1::Scale;
use k8s_openapi::api::autoscaling::v2::{
    ContainerResourceMetricStatus, HPAScalingRules, HorizontalPodAutoscalerBehavior, MetricSpec,
    MetricStatus, MetricTarget, MetricValueStatus, ResourceMetricStatus,
};
use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use tracing::{debug, info};

use super::replicas::{ReplicaCalculator, ReplicaProposal, ResourceTarget};
use crate::client::{mpa_reference, EventRecorder, EventType, MetricsClient, PodClient};
use crate::crd::{condition_types, MultidimPodAutoscaler};
use crate::error::{Error, Result};
use crate::model::Mpa;
use crate::models::{ContainerMetricsSnapshot, MpaId, ResourceName};
use crate::quantity::{parse_lenient, to_quantity};
use crate::target::{ControllerFetcher, ControllerKey, Selector};

/// Window over which the highest recent recommendation wins when no
/// behavior is configured
pub const DEFAULT_DOWNSCALE_STABILIZATION: Duration = Duration::minutes(5);

const SCALE_UP_LIMIT_FACTOR: i32 = 2;
const SCALE_UP_LIMIT_MINIMUM: i32 = 4;

#[derive(Debug, Clone, Copy)]
struct TimestampedRecommendation {
    recommendation: i32,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct ScaleEvent {
    replica_change: i32,
    timestamp: DateTime<Utc>,
    outdated: bool,
}

/// Per-MPA memory of past recommendations and scale changes
#[derive(Debug, Default)]
struct ScaleHistory {
    recommendations: Vec<TimestampedRecommendation>,
    scale_up_events: Vec<ScaleEvent>,
    scale_down_events: Vec<ScaleEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectPolicy {
    Max,
    Min,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PolicyKind {
    Pods,
    Percent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScalingPolicy {
    kind: PolicyKind,
    value: i32,
    period: Duration,
}

/// One direction of a behavior with defaults filled in
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScalingRules {
    stabilization_window: Duration,
    select_policy: SelectPolicy,
    policies: Vec<ScalingPolicy>,
}

impl ScalingRules {
    fn from_api(
        rules: Option<&HPAScalingRules>,
        default_window: Duration,
        default_policies: Vec<ScalingPolicy>,
    ) -> Self {
        let Some(rules) = rules else {
            return Self {
                stabilization_window: default_window,
                select_policy: SelectPolicy::Max,
                policies: default_policies,
            };
        };
        let policies: Vec<ScalingPolicy> = rules
            .policies
            .iter()
            .flatten()
            .filter_map(|p| {
                let kind = match p.type_.as_str() {
                    "Pods" => PolicyKind::Pods,
                    "Percent" => PolicyKind::Percent,
                    _ => return None,
                };
                Some(ScalingPolicy {
                    kind,
                    value: p.value,
                    period: Duration::seconds(p.period_seconds as i64),
                })
            })
            .collect();
        Self {
            stabilization_window: rules
                .stabilization_window_seconds
                .map(|s| Duration::seconds(s as i64))
                .unwrap_or(default_window),
            select_policy: match rules.select_policy.as_deref() {
                Some("Min") => SelectPolicy::Min,
                Some("Disabled") => SelectPolicy::Disabled,
                _ => SelectPolicy::Max,
            },
            policies: if policies.is_empty() {
                default_policies
            } else {
                policies
            },
        }
    }

    fn scale_up(behavior: &HorizontalPodAutoscalerBehavior) -> Self {
        let period = Duration::seconds(15);
        Self::from_api(
            behavior.scale_up.as_ref(),
            Duration::zero(),
            vec![
                ScalingPolicy {
                    kind: PolicyKind::Pods,
                    value: 4,
                    period,
                },
                ScalingPolicy {
                    kind: PolicyKind::Percent,
                    value: 100,
                    period,
                },
            ],
        )
    }

    fn scale_down(behavior: &HorizontalPodAutoscalerBehavior, default_window: Duration) -> Self {
        Self::from_api(
            behavior.scale_down.as_ref(),
            default_window,
            vec![ScalingPolicy {
                kind: PolicyKind::Percent,
                value: 100,
                period: Duration::seconds(15),
            }],
        )
    }

    fn longest_period(&self) -> Duration {
        self.policies
            .iter()
            .map(|p| p.period)
            .max()
            .unwrap_or_else(Duration::zero)
    }
}

/// Sum of the replica changes recorded within `period` before `now`
fn replicas_change_in_period(events: &[ScaleEvent], period: Duration, now: DateTime<Utc>) -> i32 {
    events
        .iter()
        .filter(|e| e.timestamp + period > now)
        .fold(0i32, |sum, e| sum.saturating_add(e.replica_change))
}

fn scale_up_limit(
    current: i32,
    up_events: &[ScaleEvent],
    down_events: &[ScaleEvent],
    rules: &ScalingRules,
    now: DateTime<Utc>,
) -> i32 {
    let (mut result, select): (i32, fn(i32, i32) -> i32) = match rules.select_policy {
        SelectPolicy::Disabled => return current,
        SelectPolicy::Max => (i32::MIN, std::cmp::max),
        SelectPolicy::Min => (i32::MAX, std::cmp::min),
    };
    for policy in &rules.policies {
        let added = replicas_change_in_period(up_events, policy.period, now);
        let deleted = replicas_change_in_period(down_events, policy.period, now);
        let period_start = current.saturating_sub(added).saturating_add(deleted);
        let proposed = match policy.kind {
            PolicyKind::Pods => period_start.saturating_add(policy.value),
            PolicyKind::Percent => {
                (period_start as f64 * (1.0 + policy.value as f64 / 100.0)).ceil() as i32
            }
        };
        result = select(result, proposed);
    }
    result
}

fn scale_down_limit(
    current: i32,
    up_events: &[ScaleEvent],
    down_events: &[ScaleEvent],
    rules: &ScalingRules,
    now: DateTime<Utc>,
) -> i32 {
    let (mut result, select): (i32, fn(i32, i32) -> i32) = match rules.select_policy {
        SelectPolicy::Disabled => return current,
        SelectPolicy::Max => (i32::MAX, std::cmp::min),
        SelectPolicy::Min => (i32::MIN, std::cmp::max),
    };
    for policy in &rules.policies {
        let added = replicas_change_in_period(up_events, policy.period, now);
        let deleted = replicas_change_in_period(down_events, policy.period, now);
        let period_start = current.saturating_sub(added).saturating_add(deleted);
        let proposed = match policy.kind {
            PolicyKind::Pods => period_start.saturating_sub(policy.value),
            PolicyKind::Percent => {
                (period_start as f64 * (1.0 - policy.value as f64 / 100.0)) as i32
            }
        };
        result = select(result, proposed);
    }
    result
}

/// Limits the desired count to `[min, max]` and to the fixed scale-up rate.
/// Returns the count with the reason and message of the ScalingLimited condition.
pub fn convert_desired_replicas_with_rules(
    current: i32,
    desired: i32,
    min: i32,
    max: i32,
) -> (i32, &'static str, &'static str) {
    let limit = SCALE_UP_LIMIT_FACTOR.saturating_mul(current).max(SCALE_UP_LIMIT_MINIMUM);
    let (maximum_allowed, max_reason, max_message) = if max > limit {
        (
            limit,
            "ScaleUpLimit",
            "the desired replica count is increasing faster than the maximum scale rate",
        )
    } else {
        (
            max,
            "TooManyReplicas",
            "the desired replica count is more than the maximum replica count",
        )
    };
    let (minimum_allowed, min_message) = if min == 0 {
        (1, "the desired replica count is zero")
    } else {
        (
            min,
            "the desired replica count is less than the minimum replica count",
        )
    };
    if desired < minimum_allowed {
        return (minimum_allowed, "TooFewReplicas", min_message);
    }
    if desired > maximum_allowed {
        return (maximum_allowed, max_reason, max_message);
    }
    (
        desired,
        "DesiredWithinRange",
        "the desired count is within the acceptable range",
    )
}

/// Replica count proposed by one metric goal
#[derive(Debug, Clone)]
struct MetricProposal {
    replicas: i32,
    name: String,
    status: MetricStatus,
}

fn resource_target(resource: ResourceName, target: &MetricTarget) -> Result<ResourceTarget> {
    if let Some(utilization) = target.average_utilization {
        return Ok(ResourceTarget::Utilization(utilization));
    }
    if let Some(value) = &target.average_value {
        return Ok(ResourceTarget::AverageValue(parse_lenient(resource, &value.0)?));
    }
    Err(Error::metrics(
        "invalid resource metric source: neither a utilization target nor a value target was set",
    ))
}

fn value_status(resource: ResourceName, proposal: &ReplicaProposal) -> MetricValueStatus {
    MetricValueStatus {
        average_utilization: proposal.utilization,
        average_value: Some(to_quantity(resource, proposal.average_value)),
        value: None,
    }
}

fn metric_name(resource: ResourceName, container: bool, target: ResourceTarget) -> String {
    let kind = if container {
        "container resource"
    } else {
        "resource"
    };
    match target {
        ResourceTarget::Utilization(_) => {
            format!("{} {} utilization (percentage of request)", resource, kind)
        }
        ResourceTarget::AverageValue(_) => format!("{} {}", resource, kind),
    }
}

/// Computes and records desired replica counts for every MPA with goals
pub struct HorizontalController {
    fetcher: ControllerFetcher,
    pods: Arc<dyn PodClient>,
    metrics: Arc<dyn MetricsClient>,
    events: Arc<dyn EventRecorder>,
    calculator: ReplicaCalculator,
    downscale_stabilization: Duration,
    history: HashMap<MpaId, ScaleHistory>,
}

/// Inputs shared by the metric computations of one MPA
struct MetricInputs<'a> {
    current: i32,
    pods: &'a [Pod],
    snapshots: &'a Result<Vec<ContainerMetricsSnapshot>>,
    selector: &'a Selector,
    now: DateTime<Utc>,
}

impl HorizontalController {
    pub fn new(
        fetcher: ControllerFetcher,
        pods: Arc<dyn PodClient>,
        metrics: Arc<dyn MetricsClient>,
        events: Arc<dyn EventRecorder>,
        calculator: ReplicaCalculator,
        downscale_stabilization: Duration,
    ) -> Self {
        Self {
            fetcher,
            pods,
            metrics,
            events,
            calculator,
            downscale_stabilization,
            history: HashMap::new(),
        }
    }

    /// Forgets the scale history of MPAs that no longer exist
    pub fn retain(&mut self, keep: impl Fn(&MpaId) -> bool) {
        self.history.retain(|id, _| keep(id));
    }

    async fn warn(&self, reference: &ObjectReference, reason: &str, message: &str) {
        self.events
            .record(reference, EventType::Warning, reason, message)
            .await;
    }

    /// Updates the horizontal status fields and conditions of `mpa`
    pub async fn reconcile(
        &mut self,
        object: &MultidimPodAutoscaler,
        mpa: &mut Mpa,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let reference = mpa_reference(object);
        let Some(target) = mpa.scale_target_ref.clone() else {
            return Err(Error::validation(format!("{} has no scaleTargetRef", mpa.id)));
        };
        let key = ControllerKey::new(
            &mpa.id.namespace,
            &target.kind,
            &target.name,
            target.api_version.clone(),
        );

        let scale = match self.fetcher.get_scale(&key).await {
            Ok((_, scale)) => scale,
            Err(e) => {
                self.warn(&reference, "FailedGetScale", &e.to_string()).await;
                mpa.set_condition(
                    condition_types::ABLE_TO_SCALE,
                    false,
                    "FailedGetScale",
                    &format!(
                        "the MPA controller was unable to get the target's current scale: {}",
                        e
                    ),
                );
                return Err(e);
            }
        };
        mpa.set_condition(
            condition_types::ABLE_TO_SCALE,
            true,
            "SucceededGetScale",
            "the MPA controller was able to get the target's current scale",
        );

        let current = scale
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .or_else(|| scale.status.as_ref().map(|s| s.replicas))
            .unwrap_or(0);
        let (min, max) = (mpa.min_replicas, mpa.max_replicas);

        let mut rescale_reason = String::new();
        let desired = if current == 0 && min != 0 {
            mpa.set_condition(
                condition_types::SCALING_ACTIVE,
                false,
                "ScalingDisabled",
                "scaling is disabled since the replica count of the target is zero",
            );
            None
        } else if current > max {
            rescale_reason = "Current number of replicas above Spec.MaxReplicas".to_string();
            Some(max)
        } else if current < min {
            rescale_reason = "Current number of replicas below Spec.MinReplicas".to_string();
            Some(min)
        } else {
            let (proposed, metric, statuses) =
                match self.replicas_for_metrics(&reference, mpa, &scale, current, now).await {
                    Ok(result) => result,
                    Err(e) => {
                        mpa.current_replicas = Some(current);
                        return Err(e);
                    }
                };
            mpa.current_metrics = statuses;
            if proposed > current {
                rescale_reason = format!("{} above target", metric);
            } else if proposed < current {
                rescale_reason = "All metrics below target".to_string();
            }
            Some(match mpa.behavior.clone() {
                None => self.normalize_desired_replicas(mpa, current, proposed, now),
                Some(behavior) => {
                    self.normalize_desired_replicas_with_behavior(
                        mpa, &behavior, current, proposed, now,
                    )
                }
            })
        };

        mpa.current_replicas = Some(current);
        mpa.desired_replicas = desired;
        let Some(desired) = desired.filter(|d| *d != current) else {
            debug!(mpa = %mpa.id, replicas = current, "Decided not to scale");
            return Ok(());
        };

        mpa.set_condition(
            condition_types::ABLE_TO_SCALE,
            true,
            "SucceededRescale",
            &format!(
                "the MPA controller was able to update the target scale to {}",
                desired
            ),
        );
        self.events
            .record(
                &reference,
                EventType::Normal,
                "SuccessfulRescale",
                &format!("New size: {}; reason: {}", desired, rescale_reason),
            )
            .await;
        self.store_scale_event(mpa, current, desired, now);
        mpa.last_scale_time = Some(now);
        info!(
            mpa = %mpa.id,
            current = current,
            desired = desired,
            reason = %rescale_reason,
            "Desired replica count changed"
        );
        Ok(())
    }

    /// Largest replica count proposed by any metric goal
    async fn replicas_for_metrics(
        &self,
        reference: &ObjectReference,
        mpa: &mut Mpa,
        scale: &Scale,
        current: i32,
        now: DateTime<Utc>,
    ) -> Result<(i32, String, Vec<MetricStatus>)> {
        if mpa.metrics.is_empty() {
            return Ok((current, String::new(), Vec::new()));
        }
        let Some(raw_selector) = scale.status.as_ref().and_then(|s| s.selector.clone()) else {
            self.warn(reference, "SelectorRequired", "selector is required")
                .await;
            mpa.set_condition(
                condition_types::SCALING_ACTIVE,
                false,
                "InvalidSelector",
                "the MPA target's scale is missing a selector",
            );
            return Err(Error::metrics("selector is required"));
        };
        let selector = match Selector::parse(&raw_selector) {
            Ok(selector) => selector,
            Err(e) => {
                let message = format!("couldn't convert selector into a corresponding internal selector object: {}", e);
                self.warn(reference, "InvalidSelector", &message).await;
                mpa.set_condition(
                    condition_types::SCALING_ACTIVE,
                    false,
                    "InvalidSelector",
                    &message,
                );
                return Err(e);
            }
        };

        let namespace = mpa.id.namespace.clone();
        let pods = self.pods.list_pods(Some(&namespace)).await?;
        let snapshots = self.metrics.container_metrics(Some(&namespace)).await;
        let inputs = MetricInputs {
            current,
            pods: &pods,
            snapshots: &snapshots,
            selector: &selector,
            now,
        };

        let mut best: Option<MetricProposal> = None;
        let mut statuses = Vec::new();
        let mut invalid = 0;
        let mut first_invalid: Option<(&'static str, String)> = None;
        for spec in &mpa.metrics {
            match self.replicas_for_metric(spec, &inputs) {
                Ok(proposal) => {
                    statuses.push(proposal.status.clone());
                    if best.as_ref().map_or(true, |b| proposal.replicas > b.replicas) {
                        best = Some(proposal);
                    }
                }
                Err((reason, e)) => {
                    invalid += 1;
                    let message = format!("the MPA was unable to compute the replica count: {}", e);
                    self.warn(reference, reason, &message).await;
                    first_invalid.get_or_insert((reason, message));
                }
            }
        }

        let total = mpa.metrics.len();
        let scaling_down = best.as_ref().map_or(true, |b| b.replicas < current);
        if let Some((reason, message)) = first_invalid {
            if invalid >= total || scaling_down {
                mpa.set_condition(condition_types::SCALING_ACTIVE, false, reason, &message);
                return Err(Error::metrics(format!(
                    "invalid metrics ({} invalid out of {}), first error is: {}",
                    invalid, total, message
                )));
            }
        }
        let Some(best) = best else {
            return Ok((current, String::new(), statuses));
        };
        mpa.set_condition(
            condition_types::SCALING_ACTIVE,
            true,
            "ValidMetricFound",
            &format!(
                "the MPA was able to successfully calculate a replica count from {}",
                best.name
            ),
        );
        Ok((best.replicas, best.name, statuses))
    }

    /// Proposal of one metric goal. Errors carry the condition reason.
    fn replicas_for_metric(
        &self,
        spec: &MetricSpec,
        inputs: &MetricInputs<'_>,
    ) -> std::result::Result<MetricProposal, (&'static str, Error)> {
        let (name, container, target) = match spec.type_.as_str() {
            "Resource" => {
                let source = spec.resource.as_ref().ok_or_else(|| {
                    (
                        "FailedGetResourceMetric",
                        Error::metrics("resource metric without a resource source"),
                    )
                })?;
                (&source.name, None, &source.target)
            }
            "ContainerResource" => {
                let source = spec.container_resource.as_ref().ok_or_else(|| {
                    (
                        "FailedGetContainerResourceMetric",
                        Error::metrics("container resource metric without a source"),
                    )
                })?;
                (&source.name, Some(source.container.as_str()), &source.target)
            }
            other => {
                return Err((
                    "InvalidMetricSourceType",
                    Error::metrics(format!("unknown metric source type {:?}", other)),
                ))
            }
        };
        let reason = if container.is_some() {
            "FailedGetContainerResourceMetric"
        } else {
            "FailedGetResourceMetric"
        };
        let resource = ResourceName::parse(name).ok_or_else(|| {
            (
                reason,
                Error::metrics(format!("unsupported resource {}", name)),
            )
        })?;
        let target = resource_target(resource, target).map_err(|e| (reason, e))?;
        let snapshots = inputs
            .snapshots
            .as_ref()
            .map_err(|e| (reason, Error::metrics(e.to_string())))?;
        let proposal = self
            .calculator
            .resource_replicas(
                inputs.current,
                target,
                resource,
                container,
                inputs.pods,
                snapshots,
                inputs.selector,
                inputs.now,
            )
            .map_err(|e| (reason, e))?;

        let current = value_status(resource, &proposal);
        let status = match container {
            None => MetricStatus {
                type_: "Resource".to_string(),
                resource: Some(ResourceMetricStatus {
                    name: name.clone(),
                    current,
                }),
                ..Default::default()
            },
            Some(container) => MetricStatus {
                type_: "ContainerResource".to_string(),
                container_resource: Some(ContainerResourceMetricStatus {
                    container: container.to_string(),
                    name: name.clone(),
                    current,
                }),
                ..Default::default()
            },
        };
        Ok(MetricProposal {
            replicas: proposal.replicas,
            name: metric_name(resource, container.is_some(), target),
            status,
        })
    }

    /// Highest recommendation within the downscale window, recording the new one
    fn stabilize_recommendation(&mut self, id: &MpaId, prenormalized: i32, now: DateTime<Utc>) -> i32 {
        let history = self.history.entry(id.clone()).or_default();
        let cutoff = now - self.downscale_stabilization;
        let mut stabilized = prenormalized;
        let mut old_slot = None;
        for (i, rec) in history.recommendations.iter().enumerate() {
            if rec.timestamp > cutoff {
                stabilized = stabilized.max(rec.recommendation);
            } else {
                old_slot = Some(i);
            }
        }
        let entry = TimestampedRecommendation {
            recommendation: prenormalized,
            timestamp: now,
        };
        match old_slot {
            Some(i) => history.recommendations[i] = entry,
            None => history.recommendations.push(entry),
        }
        stabilized
    }

    fn normalize_desired_replicas(
        &mut self,
        mpa: &mut Mpa,
        current: i32,
        prenormalized: i32,
        now: DateTime<Utc>,
    ) -> i32 {
        let stabilized = self.stabilize_recommendation(&mpa.id, prenormalized, now);
        if stabilized != prenormalized {
            mpa.set_condition(
                condition_types::ABLE_TO_SCALE,
                true,
                "ScaleDownStabilized",
                "recent recommendations were higher than current one, applying the highest recent recommendation",
            );
        } else {
            mpa.set_condition(
                condition_types::ABLE_TO_SCALE,
                true,
                "ReadyForNewScale",
                "recommended size matches current size",
            );
        }
        let (desired, reason, message) = convert_desired_replicas_with_rules(
            current,
            stabilized,
            mpa.min_replicas,
            mpa.max_replicas,
        );
        mpa.set_condition(
            condition_types::SCALING_LIMITED,
            desired != stabilized,
            reason,
            message,
        );
        desired
    }

    fn normalize_desired_replicas_with_behavior(
        &mut self,
        mpa: &mut Mpa,
        behavior: &HorizontalPodAutoscalerBehavior,
        current: i32,
        prenormalized: i32,
        now: DateTime<Utc>,
    ) -> i32 {
        let up = ScalingRules::scale_up(behavior);
        let down = ScalingRules::scale_down(behavior, self.downscale_stabilization);
        let history = self.history.entry(mpa.id.clone()).or_default();

        let (window, better, reason, message): (Duration, fn(i32, i32) -> i32, &str, &str) =
            if prenormalized >= current {
                (
                    up.stabilization_window,
                    std::cmp::min,
                    "ScaleUpStabilized",
                    "recent recommendations were lower than current one, applying the lowest recent recommendation",
                )
            } else {
                (
                    down.stabilization_window,
                    std::cmp::max,
                    "ScaleDownStabilized",
                    "recent recommendations were higher than current one, applying the highest recent recommendation",
                )
            };
        let cutoff = now - window;
        let oldest_kept = now - up.stabilization_window.max(down.stabilization_window);
        let mut stabilized = prenormalized;
        let mut old_slot = None;
        for (i, rec) in history.recommendations.iter().enumerate() {
            if rec.timestamp > cutoff {
                stabilized = better(stabilized, rec.recommendation);
            }
            if rec.timestamp < oldest_kept {
                old_slot = Some(i);
            }
        }
        let entry = TimestampedRecommendation {
            recommendation: prenormalized,
            timestamp: now,
        };
        match old_slot {
            Some(i) => history.recommendations[i] = entry,
            None => history.recommendations.push(entry),
        }

        if stabilized != prenormalized {
            mpa.set_condition(condition_types::ABLE_TO_SCALE, true, reason, message);
        } else {
            mpa.set_condition(
                condition_types::ABLE_TO_SCALE,
                true,
                "ReadyForNewScale",
                "recommended size matches current size",
            );
        }

        let (min, max) = (mpa.min_replicas, mpa.max_replicas);
        let (desired, reason, message) = if stabilized > current {
            let limit = scale_up_limit(
                current,
                &history.scale_up_events,
                &history.scale_down_events,
                &up,
                now,
            )
            .max(current);
            if max > limit {
                (
                    stabilized.min(limit),
                    "ScaleUpLimit",
                    "the desired replica count is increasing faster than the maximum scale rate",
                )
            } else {
                (
                    stabilized.min(max),
                    "TooManyReplicas",
                    "the desired replica count is more than the maximum replica count",
                )
            }
        } else if stabilized < current {
            let limit = scale_down_limit(
                current,
                &history.scale_up_events,
                &history.scale_down_events,
                &down,
                now,
            )
            .min(current);
            if min < limit {
                (
                    stabilized.max(limit),
                    "ScaleDownLimit",
                    "the desired replica count is decreasing faster than the maximum scale rate",
                )
            } else {
                (
                    stabilized.max(min),
                    "TooFewReplicas",
                    "the desired replica count is less than the minimum replica count",
                )
            }
        } else {
            (stabilized, "", "")
        };
        let (reason, message) = if desired == stabilized {
            (
                "DesiredWithinRange",
                "the desired count is within the acceptable range",
            )
        } else {
            (reason, message)
        };
        mpa.set_condition(
            condition_types::SCALING_LIMITED,
            desired != stabilized,
            reason,
            message,
        );
        desired
    }

    /// Remembers a replica change for the rate policies, reusing slots of
    /// events older than the longest policy period
    fn store_scale_event(&mut self, mpa: &Mpa, previous: i32, new: i32, now: DateTime<Utc>) {
        let Some(behavior) = mpa.behavior.as_ref() else {
            return;
        };
        let history = self.history.entry(mpa.id.clone()).or_default();
        let (events, rules, change) = if new > previous {
            (
                &mut history.scale_up_events,
                ScalingRules::scale_up(behavior),
                new - previous,
            )
        } else {
            (
                &mut history.scale_down_events,
                ScalingRules::scale_down(behavior, self.downscale_stabilization),
                previous - new,
            )
        };
        let cutoff = now - rules.longest_period();
        for event in events.iter_mut() {
            if event.timestamp < cutoff {
                event.outdated = true;
            }
        }
        let event = ScaleEvent {
            replica_change: change,
            timestamp: now,
            outdated: false,
        };
        match events.iter_mut().find(|e| e.outdated) {
            Some(slot) => *slot = event,
            None => events.push(event),
        }
    }
}
