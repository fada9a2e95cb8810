use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info};

use super::patch::pod_patches;
use super::recommendation::{patchable_containers, RecommendationProvider};
use crate::error::Result;
use crate::features::FeatureGates;
use crate::target::MpaMatcher;

/// Outcome of admitting one pod
#[derive(Debug, Default)]
pub struct PodPatch {
    /// Name of the controlling MPA, if any
    pub mpa: Option<String>,
    pub operations: Vec<PatchOperation>,
}

/// Computes resource patches for pods at creation time
pub struct PodHandler {
    matcher: MpaMatcher,
    provider: RecommendationProvider,
    features: FeatureGates,
}

impl PodHandler {
    pub fn new(matcher: MpaMatcher, provider: RecommendationProvider, features: FeatureGates) -> Self {
        Self {
            matcher,
            provider,
            features,
        }
    }

    /// Patch for `pod` in `namespace`. Pods without a controlling MPA get an
    /// empty patch.
    pub async fn patch(&self, mut pod: Pod, namespace: &str) -> Result<PodPatch> {
        // Pods created by controllers carry no namespace until admitted
        if pod.metadata.namespace.as_deref().map_or(true, str::is_empty) {
            pod.metadata.namespace = Some(namespace.to_string());
        }
        let pod_name = match pod.metadata.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{}<generated>", pod.metadata.generate_name.clone().unwrap_or_default()),
        };

        let Some(mpa) = self.matcher.matching_mpa(&pod).await? else {
            debug!(pod = %pod_name, namespace = %namespace, "No matching MPA found");
            return Ok(PodPatch::default());
        };

        let containers = patchable_containers(&pod, self.features.native_sidecar);
        let (resources, annotations) = self
            .provider
            .containers_resources(&pod, &containers, &mpa)
            .await?;
        for (container, notes) in &annotations {
            info!(
                pod = %pod_name,
                mpa = %mpa.name_any(),
                container = %container,
                notes = %notes.join("; "),
                "Recommendation capped"
            );
        }

        let operations = pod_patches(&pod, &mpa.name_any(), &containers, &resources);
        debug!(
            pod = %pod_name,
            mpa = %mpa.name_any(),
            operations = operations.len(),
            "Computed pod patch"
        );
        Ok(PodPatch {
            mpa: Some(mpa.name_any()),
            operations,
        })
    }
}
