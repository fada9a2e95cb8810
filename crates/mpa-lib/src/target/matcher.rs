use std::cmp::Ordering;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, warn};

use super::fetcher::{controller_of, ControllerFetcher, ControllerKey};
use super::selector::{Labels, Selector};
use crate::client::MpaClient;
use crate::crd::{MultidimPodAutoscaler, UpdateMode};
use crate::error::Result;

/// An MPA paired with the pod selector of its target
#[derive(Debug, Clone)]
pub struct MpaWithSelector {
    pub mpa: MultidimPodAutoscaler,
    pub selector: Selector,
}

/// Orders MPAs by strength: older first, then by name
pub fn strength_order(a: &MultidimPodAutoscaler, b: &MultidimPodAutoscaler) -> Ordering {
    let a_time = a.creation_timestamp().map(|t| t.0);
    let b_time = b.creation_timestamp().map(|t| t.0);
    match (a_time, b_time) {
        (Some(x), Some(y)) if x != y => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        _ => a.name_any().cmp(&b.name_any()),
    }
}

/// True when `a` takes precedence over `b` for the same pod
pub fn stronger(a: &MultidimPodAutoscaler, b: &MultidimPodAutoscaler) -> bool {
    strength_order(a, b) == Ordering::Less
}

pub fn pod_labels(pod: &Pod) -> Labels {
    pod.metadata.labels.clone().unwrap_or_default()
}

pub fn pod_matches_mpa(pod: &Pod, candidate: &MpaWithSelector) -> bool {
    pod.namespace() == candidate.mpa.namespace() && candidate.selector.matches(&pod_labels(pod))
}

/// Topmost well-known or scalable controller of the pod
pub async fn find_parent_controller_for_pod(
    pod: &Pod,
    fetcher: &ControllerFetcher,
) -> Result<Option<ControllerKey>> {
    let owners = pod.metadata.owner_references.clone().unwrap_or_default();
    let Some(owner) = controller_of(&owners) else {
        return Ok(None);
    };
    let key = ControllerKey::from_owner(&pod.namespace().unwrap_or_default(), owner);
    fetcher.find_topmost_well_known_or_scalable(&key).await
}

/// Strongest MPA whose target is the pod's topmost controller and whose
/// selector matches the pod's labels
pub async fn controlling_mpa_for_pod<'a>(
    pod: &Pod,
    candidates: &'a [MpaWithSelector],
    fetcher: &ControllerFetcher,
) -> Option<&'a MpaWithSelector> {
    let parent = match find_parent_controller_for_pod(pod, fetcher).await {
        Ok(Some(parent)) => parent,
        Ok(None) => return None,
        Err(e) => {
            warn!(pod = %pod.name_any(), error = %e, "Failed to get parent controller for pod");
            return None;
        }
    };

    let mut controlling: Option<&MpaWithSelector> = None;
    for candidate in candidates {
        let Some(target) = candidate.mpa.spec.scale_target_ref.as_ref() else {
            continue;
        };
        if target.kind != parent.kind || target.name != parent.name {
            continue;
        }
        if !pod_matches_mpa(pod, candidate) {
            continue;
        }
        if controlling.map_or(true, |current| stronger(&candidate.mpa, &current.mpa)) {
            controlling = Some(candidate);
        }
    }
    controlling
}

/// Resolves the MPA that controls a pod at admission time
#[derive(Clone)]
pub struct MpaMatcher {
    mpas: Arc<dyn MpaClient>,
    fetcher: ControllerFetcher,
}

impl MpaMatcher {
    pub fn new(mpas: Arc<dyn MpaClient>, fetcher: ControllerFetcher) -> Self {
        Self { mpas, fetcher }
    }

    pub fn fetcher(&self) -> &ControllerFetcher {
        &self.fetcher
    }

    /// MPAs of the namespace that are not Off, with resolved selectors
    pub async fn active_mpas(&self, namespace: &str) -> Result<Vec<MpaWithSelector>> {
        let mut active = Vec::new();
        for mpa in self.mpas.list_mpas(Some(namespace)).await? {
            if mpa.update_mode() == UpdateMode::Off {
                continue;
            }
            let Some(target) = mpa.spec.scale_target_ref.as_ref() else {
                continue;
            };
            let key = ControllerKey::new(
                namespace,
                target.kind.clone(),
                target.name.clone(),
                target.api_version.clone(),
            );
            match self.fetcher.selector_for(&key).await {
                Ok(selector) => active.push(MpaWithSelector { mpa, selector }),
                Err(e) => {
                    debug!(mpa = %mpa.name_any(), error = %e, "Cannot get target selector");
                }
            }
        }
        Ok(active)
    }

    pub async fn matching_mpa(&self, pod: &Pod) -> Result<Option<MultidimPodAutoscaler>> {
        let namespace = pod.namespace().unwrap_or_default();
        let candidates = self.active_mpas(&namespace).await?;
        Ok(controlling_mpa_for_pod(pod, &candidates, &self.fetcher)
            .await
            .map(|m| m.mpa.clone()))
    }
}
