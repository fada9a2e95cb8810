use k8s_openapi::api::core::v1::{Container, Pod};
use kube::ResourceExt;
use tracing::debug;

use crate::crd::{ContainerControlledValues, MultidimPodAutoscaler};
use crate::error::Result;
use crate::models::Resources;
use crate::policy::{
    container_requests_and_limits, controlled_values, proportional_limit, CappingAnnotations,
    CappingProcessor,
};
use crate::quantity::resources_from_list;

/// Restart policy that turns an init container into a native sidecar
const SIDECAR_RESTART_POLICY: &str = "Always";

/// Which list of the pod spec a container lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerList {
    Containers,
    InitContainers,
}

impl ContainerList {
    /// JSON pointer of the list inside a pod
    pub fn path(&self) -> &'static str {
        match self {
            ContainerList::Containers => "/spec/containers",
            ContainerList::InitContainers => "/spec/initContainers",
        }
    }
}

/// A container the admission controller may patch, with its position in the pod
#[derive(Debug, Clone)]
pub struct PodContainer {
    pub list: ContainerList,
    pub index: usize,
    pub container: Container,
}

pub fn is_native_sidecar(container: &Container) -> bool {
    container.restart_policy.as_deref() == Some(SIDECAR_RESTART_POLICY)
}

/// Regular containers, followed by native sidecars when `native_sidecar` is on
pub fn patchable_containers(pod: &Pod, native_sidecar: bool) -> Vec<PodContainer> {
    let Some(spec) = pod.spec.as_ref() else {
        return Vec::new();
    };
    let mut out: Vec<PodContainer> = spec
        .containers
        .iter()
        .enumerate()
        .map(|(index, c)| PodContainer {
            list: ContainerList::Containers,
            index,
            container: c.clone(),
        })
        .collect();
    if native_sidecar {
        let sidecars = spec
            .init_containers
            .iter()
            .flatten()
            .enumerate()
            .filter(|(_, c)| is_native_sidecar(c))
            .map(|(index, c)| PodContainer {
                list: ContainerList::InitContainers,
                index,
                container: c.clone(),
            });
        out.extend(sidecars);
    }
    out
}

/// Requests and limits to write into one container. Empty maps leave the
/// container unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerResources {
    pub requests: Resources,
    pub limits: Resources,
}

impl ContainerResources {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.limits.is_empty()
    }
}

/// Turns the MPA recommendation into concrete resources for each container of
/// a pod being admitted
#[derive(Clone)]
pub struct RecommendationProvider {
    capping: CappingProcessor,
}

impl RecommendationProvider {
    pub fn new(capping: CappingProcessor) -> Self {
        Self { capping }
    }

    /// One entry per container in `containers`, in the same order, plus the
    /// capping notes collected on the way
    pub async fn containers_resources(
        &self,
        pod: &Pod,
        containers: &[PodContainer],
        mpa: &MultidimPodAutoscaler,
    ) -> Result<(Vec<ContainerResources>, CappingAnnotations)> {
        let Some(recommendation) = mpa.recommendation() else {
            debug!(mpa = %mpa.name_any(), "MPA has no recommendation yet");
            return Ok((vec![ContainerResources::default(); containers.len()], CappingAnnotations::new()));
        };

        let namespace = pod.namespace().unwrap_or_default();
        let specs: Vec<Container> = containers.iter().map(|c| c.container.clone()).collect();
        let policies = mpa.container_policies();
        let (capped, mut annotations, limit_ranges) = self
            .capping
            .apply(recommendation, policies, &namespace, &specs)
            .await?;
        let default_limits = limit_ranges
            .container
            .as_ref()
            .and_then(|item| item.default.as_ref())
            .map(resources_from_list)
            .unwrap_or_default();

        let mut out = Vec::with_capacity(containers.len());
        for pod_container in containers {
            let container = &pod_container.container;
            let Some(rec) = capped
                .container_recommendations
                .iter()
                .find(|r| r.container_name == container.name)
            else {
                out.push(ContainerResources::default());
                continue;
            };

            let requests = if rec.target.is_empty() {
                resources_from_list(&rec.uncapped_target)
            } else {
                resources_from_list(&rec.target)
            };

            let mut limits = Resources::new();
            if controlled_values(&container.name, policies)
                == ContainerControlledValues::RequestsAndLimits
            {
                let (original_requests, original_limits) = container_requests_and_limits(container);
                for (resource, request) in &requests {
                    let (limit, note) = proportional_limit(
                        original_limits.get(resource).copied(),
                        original_requests.get(resource).copied(),
                        *request,
                        default_limits.get(resource).copied(),
                    );
                    if let Some(note) = note {
                        annotations
                            .entry(container.name.clone())
                            .or_default()
                            .push(format!("{} {}", resource, note));
                    }
                    if let Some(limit) = limit {
                        limits.insert(*resource, limit);
                    }
                }
            }
            out.push(ContainerResources { requests, limits });
        }
        Ok((out, annotations))
    }
}
