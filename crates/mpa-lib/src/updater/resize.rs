//! In-place pod resize

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

/// Deferred resizes older than this fall back to eviction
pub const DEFERRED_RESIZE_TIMEOUT: Duration = Duration::minutes(5);

pub const RESIZE_INFEASIBLE: &str = "Infeasible";
pub const RESIZE_DEFERRED: &str = "Deferred";

const RESTART_NOT_REQUIRED: &str = "NotRequired";

pub fn resize_status(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|s| s.resize.as_deref())
        .filter(|s| !s.is_empty())
}

/// A resize was requested and has not completed yet
pub fn is_in_place_updating(pod: &Pod) -> bool {
    resize_status(pod).is_some()
}

/// Every container declares a resize policy, so the runtime supports
/// in-place resize for this pod
pub fn supports_in_place_resize(pod: &Pod) -> bool {
    let Some(spec) = pod.spec.as_ref() else {
        return false;
    };
    !spec.containers.is_empty() && spec.containers.iter().all(|c| c.resize_policy.is_some())
}

/// Resizing does not restart any container
pub fn resize_without_restart(pod: &Pod) -> bool {
    pod.spec.iter().flat_map(|s| s.containers.iter()).all(|c| {
        c.resize_policy.as_ref().map_or(false, |policies| {
            policies
                .iter()
                .all(|p| p.restart_policy == RESTART_NOT_REQUIRED)
        })
    })
}

fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

/// Remembers since when each pod's resize has been deferred
#[derive(Debug, Default)]
pub struct ResizeTracker {
    deferred_since: HashMap<String, DateTime<Utc>>,
}

impl ResizeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the resize state of the live pods and forgets the rest
    pub fn observe(&mut self, pods: &[Pod], now: DateTime<Utc>) {
        let mut deferred = HashMap::new();
        for pod in pods {
            if resize_status(pod) == Some(RESIZE_DEFERRED) {
                let key = pod_key(pod);
                let since = self.deferred_since.get(&key).copied().unwrap_or(now);
                deferred.insert(key, since);
            }
        }
        self.deferred_since = deferred;
    }

    /// The resize of `pod` cannot complete: the node rejected it, or it has
    /// been deferred for longer than [`DEFERRED_RESIZE_TIMEOUT`]
    pub fn resize_stuck(&self, pod: &Pod, now: DateTime<Utc>) -> bool {
        match resize_status(pod) {
            Some(RESIZE_INFEASIBLE) => true,
            Some(RESIZE_DEFERRED) => self
                .deferred_since
                .get(&pod_key(pod))
                .map_or(false, |since| now - *since > DEFERRED_RESIZE_TIMEOUT),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use k8s_openapi::api::core::v1::ContainerResizePolicy;

    fn resizing(status: &str) -> Pod {
        let mut pod = pod("p", "web", None, vec![container("app", 100, 1024)]);
        pod.status.get_or_insert_with(Default::default).resize = Some(status.to_string());
        pod
    }

    #[test]
    fn test_resize_status() {
        let idle = pod("p", "web", None, vec![container("app", 100, 1024)]);
        assert!(!is_in_place_updating(&idle));
        assert!(is_in_place_updating(&resizing("InProgress")));
        assert_eq!(resize_status(&resizing("Deferred")), Some(RESIZE_DEFERRED));
    }

    #[test]
    fn test_resize_policy_support() {
        let mut pod = pod("p", "web", None, vec![container("app", 100, 1024)]);
        assert!(!supports_in_place_resize(&pod));

        pod.spec.as_mut().unwrap().containers[0].resize_policy = Some(vec![ContainerResizePolicy {
            resource_name: "cpu".to_string(),
            restart_policy: "NotRequired".to_string(),
        }]);
        assert!(supports_in_place_resize(&pod));
        assert!(resize_without_restart(&pod));

        pod.spec.as_mut().unwrap().containers[0].resize_policy = Some(vec![ContainerResizePolicy {
            resource_name: "memory".to_string(),
            restart_policy: "RestartContainer".to_string(),
        }]);
        assert!(!resize_without_restart(&pod));
    }

    #[test]
    fn test_infeasible_is_stuck_immediately() {
        let tracker = ResizeTracker::new();
        assert!(tracker.resize_stuck(&resizing("Infeasible"), t0()));
        assert!(!tracker.resize_stuck(&resizing("InProgress"), t0()));
    }

    #[test]
    fn test_deferred_is_stuck_after_timeout() {
        let mut tracker = ResizeTracker::new();
        let pod = resizing("Deferred");
        tracker.observe(&[pod.clone()], t0());
        tracker.observe(&[pod.clone()], t0() + Duration::minutes(3));
        assert!(!tracker.resize_stuck(&pod, t0() + Duration::minutes(3)));
        assert!(tracker.resize_stuck(&pod, t0() + Duration::minutes(6)));

        // Leaving the deferred state resets the clock
        tracker.observe(&[], t0() + Duration::minutes(7));
        tracker.observe(&[pod.clone()], t0() + Duration::minutes(8));
        assert!(!tracker.resize_stuck(&pod, t0() + Duration::minutes(9)));
    }
}
