//! Disruption limits for one MPA's pods
//!
//! Pods are grouped by the controller that created them. Each group may lose
//! at most `tolerance` running pods per pass, and groups with fewer live pods
//! than the configured minimum are never touched.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, warn};

use super::resize::{is_in_place_updating, resize_without_restart, supports_in_place_resize, ResizeTracker};
use crate::client::{mpa_reference, pod_reference, ControllerClient, EventRecorder, EventType, PodClient};
use crate::crd::MultidimPodAutoscaler;
use crate::error::{Error, Result};
use crate::target::{controller_of, ControllerKey};

const PHASE_PENDING: &str = "Pending";
const JOB: &str = "Job";

/// Default minimum number of live pods a group needs before any is updated
pub const DEFAULT_MIN_REPLICAS: usize = 2;
pub const DEFAULT_EVICTION_TOLERANCE: f64 = 0.5;

fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

fn is_pending(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some(PHASE_PENDING)
}

/// Pods of a group that may be disrupted in one pass given `configured`
/// replicas: `ceil(fraction * configured)`, and at least one when the group
/// has more than one replica
pub fn eviction_tolerance(configured: usize, fraction: f64) -> usize {
    let tolerance = (configured as f64 * fraction.max(0.0)).ceil() as usize;
    if configured > 1 {
        tolerance.max(1)
    } else {
        tolerance
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct GroupStats {
    configured: usize,
    pending: usize,
    running: usize,
    tolerance: usize,
    evicted: usize,
    in_place_updating: usize,
}

impl GroupStats {
    fn has_headroom(&self) -> bool {
        let should_be_alive = self.configured.saturating_sub(self.tolerance);
        let actually_alive = self
            .running
            .saturating_sub(self.evicted + self.in_place_updating);
        if actually_alive > should_be_alive {
            return true;
        }
        // A fully running group with no tolerance may still lose one pod
        self.running == self.configured
            && self.tolerance == 0
            && self.evicted == 0
            && self.in_place_updating == 0
    }
}

/// Builds an [`EvictionRestriction`] for each MPA in a pass
#[derive(Clone)]
pub struct EvictionRestrictionFactory {
    controllers: Arc<dyn ControllerClient>,
    min_replicas: usize,
    tolerance_fraction: f64,
    skip_disruption_budget_in_place: bool,
}

impl EvictionRestrictionFactory {
    pub fn new(controllers: Arc<dyn ControllerClient>, min_replicas: usize, tolerance_fraction: f64) -> Self {
        Self {
            controllers,
            min_replicas,
            tolerance_fraction,
            skip_disruption_budget_in_place: false,
        }
    }

    /// Resizes that restart no container ignore the disruption budget
    pub fn with_in_place_skip_disruption_budget(mut self, skip: bool) -> Self {
        self.skip_disruption_budget_in_place = skip;
        self
    }

    async fn configured_replicas(&self, creator: &ControllerKey, live: usize) -> Result<usize> {
        if creator.kind == JOB || !creator.is_well_known() {
            return Ok(live);
        }
        let info = self
            .controllers
            .get_controller(creator)
            .await?
            .ok_or_else(|| Error::unknown_key(creator.to_string()))?;
        match info.configured_replicas {
            Some(replicas) if replicas > 0 => Ok(replicas as usize),
            _ => Err(Error::validation(format!("{} has no replicas configured", creator))),
        }
    }

    /// Groups `pods` by creator and computes each group's disruption budget
    pub async fn new_restriction(&self, pods: &[Pod]) -> EvictionRestriction {
        let mut groups: HashMap<ControllerKey, Vec<&Pod>> = HashMap::new();
        for pod in pods {
            let owners = pod.owner_references();
            let Some(owner) = controller_of(owners) else {
                debug!(pod = %pod.name_any(), "Pod is not managed by any controller");
                continue;
            };
            let creator = ControllerKey::from_owner(&pod.namespace().unwrap_or_default(), owner);
            groups.entry(creator).or_default().push(pod);
        }

        let mut pod_to_creator = HashMap::new();
        let mut stats = HashMap::new();
        for (creator, members) in groups {
            let live = members.len();
            if live < self.min_replicas {
                debug!(
                    controller = %creator,
                    live_pods = live,
                    required_pods = self.min_replicas,
                    "Too few replicas"
                );
                continue;
            }
            let configured = match self.configured_replicas(&creator, live).await {
                Ok(configured) => configured,
                Err(e) => {
                    warn!(controller = %creator, error = %e, "Failed to obtain replica count");
                    continue;
                }
            };
            let mut group = GroupStats {
                configured,
                tolerance: eviction_tolerance(configured, self.tolerance_fraction),
                ..Default::default()
            };
            for pod in &members {
                pod_to_creator.insert(pod_key(pod), creator.clone());
                if is_pending(pod) {
                    group.pending += 1;
                }
                if is_in_place_updating(pod) {
                    group.in_place_updating += 1;
                }
            }
            group.running = live - group.pending;
            stats.insert(creator, group);
        }

        EvictionRestriction {
            pod_to_creator,
            stats,
            skip_disruption_budget_in_place: self.skip_disruption_budget_in_place,
        }
    }
}

/// Disruption budget of one MPA's pods for the current pass
pub struct EvictionRestriction {
    pod_to_creator: HashMap<String, ControllerKey>,
    stats: HashMap<ControllerKey, GroupStats>,
    skip_disruption_budget_in_place: bool,
}

impl EvictionRestriction {
    fn group(&self, pod: &Pod) -> Option<(&ControllerKey, &GroupStats)> {
        let creator = self.pod_to_creator.get(&pod_key(pod))?;
        self.stats.get(creator).map(|stats| (creator, stats))
    }

    /// The pod may be evicted without breaking its group's budget. A pod whose
    /// resize is in flight is only evicted when `tracker` reports it stuck.
    pub fn can_evict(&self, pod: &Pod, tracker: &ResizeTracker, now: DateTime<Utc>) -> bool {
        let Some((_, stats)) = self.group(pod) else {
            return false;
        };
        if is_pending(pod) {
            return true;
        }
        if is_in_place_updating(pod) {
            // A resizing pod already counts against the budget
            if tracker.resize_stuck(pod, now) {
                return true;
            }
            debug!(pod = %pod.name_any(), "Would be able to evict, but already resizing");
            return false;
        }
        stats.has_headroom()
    }

    /// The pod may be resized in place now
    pub fn can_in_place_update(&self, pod: &Pod) -> bool {
        let Some((_, stats)) = self.group(pod) else {
            return false;
        };
        if is_in_place_updating(pod) || !supports_in_place_resize(pod) {
            return false;
        }
        if self.skip_disruption_budget_in_place && resize_without_restart(pod) {
            return true;
        }
        stats.has_headroom()
    }

    /// Evicts `pod` and records it against the group's budget
    pub async fn evict(
        &mut self,
        pod: &Pod,
        mpa: &MultidimPodAutoscaler,
        pods: &dyn PodClient,
        events: &dyn EventRecorder,
        tracker: &ResizeTracker,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let creator = self
            .pod_to_creator
            .get(&pod_key(pod))
            .cloned()
            .ok_or_else(|| {
                Error::eviction(format!(
                    "pod not suitable for eviction {}: not in replicated pods map",
                    pod_key(pod)
                ))
            })?;
        if !self.can_evict(pod, tracker, now) {
            return Err(Error::eviction(format!(
                "cannot evict pod {}: eviction budget exceeded",
                pod_key(pod)
            )));
        }

        pods.evict_pod(pod).await?;
        events
            .record(
                &pod_reference(pod),
                EventType::Normal,
                "EvictedByMPA",
                "Pod was evicted by MPA Updater to apply resource recommendation.",
            )
            .await;
        events
            .record(
                &mpa_reference(mpa),
                EventType::Normal,
                "EvictedPod",
                &format!(
                    "MPA Updater evicted Pod {} to apply resource recommendation.",
                    pod.name_any()
                ),
            )
            .await;

        if !is_pending(pod) {
            if let Some(stats) = self.stats.get_mut(&creator) {
                stats.evicted += 1;
                if is_in_place_updating(pod) {
                    stats.in_place_updating = stats.in_place_updating.saturating_sub(1);
                }
            }
        }
        Ok(())
    }

    /// Applies `patch` through the resize sub-resource and records the pod
    /// as updating
    pub async fn in_place_update(
        &mut self,
        pod: &Pod,
        patch: &json_patch::Patch,
        pods: &dyn PodClient,
        events: &dyn EventRecorder,
    ) -> Result<()> {
        let creator = self
            .pod_to_creator
            .get(&pod_key(pod))
            .cloned()
            .ok_or_else(|| {
                Error::eviction(format!(
                    "pod not suitable for in-place update {}: not in replicated pods map",
                    pod_key(pod)
                ))
            })?;
        if !self.can_in_place_update(pod) {
            return Err(Error::eviction(format!(
                "cannot update pod {} in place: disruption budget exceeded",
                pod_key(pod)
            )));
        }

        pods.resize_pod(pod, patch).await?;
        events
            .record(
                &pod_reference(pod),
                EventType::Normal,
                "InPlaceResizedByMPA",
                "Pod was resized in place by MPA Updater.",
            )
            .await;
        if let Some(stats) = self.stats.get_mut(&creator) {
            stats.in_place_updating += 1;
        }
        Ok(())
    }
}
