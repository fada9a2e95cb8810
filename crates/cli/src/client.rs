//! Kubernetes access for the CLI

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client};
use mpa_lib::admission::{PodHandler, RecommendationProvider};
use mpa_lib::client::kube_impl::{ControllerCache, KubeCluster};
use mpa_lib::client::MpaClient;
use mpa_lib::crd::{MultidimPodAutoscaler, MultidimPodAutoscalerCheckpoint};
use mpa_lib::policy::{CappingProcessor, LimitRangeCalculator};
use mpa_lib::target::{ControllerFetcher, MpaMatcher};
use mpa_lib::FeatureGates;

/// Read-only view of the cluster's MPA objects
pub struct MpaCtlClient {
    client: Client,
    cluster: Arc<KubeCluster>,
}

impl MpaCtlClient {
    /// Connect using `kubeconfig`, or the default configuration when unset
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .context("Invalid kubeconfig")?
            }
            None => kube::Config::infer()
                .await
                .context("Failed to load Kubernetes configuration")?,
        };
        let client = Client::try_from(config).context("Failed to create Kubernetes client")?;
        let cluster = Arc::new(KubeCluster::new(client.clone(), "mpactl"));
        Ok(Self { client, cluster })
    }

    pub async fn list_mpas(&self, namespace: Option<&str>) -> Result<Vec<MultidimPodAutoscaler>> {
        self.cluster
            .list_mpas(namespace)
            .await
            .context("Failed to list MPAs")
    }

    pub async fn list_checkpoints(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<MultidimPodAutoscalerCheckpoint>> {
        self.cluster
            .list_checkpoints(namespace)
            .await
            .context("Failed to list checkpoints")
    }

    pub async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        Api::<Pod>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await
            .with_context(|| format!("Failed to get pod {}/{}", namespace, name))
    }

    /// Admission logic wired to the live cluster. Waits for the controller
    /// caches to sync.
    pub async fn pod_handler(&self, features: FeatureGates) -> Result<PodHandler> {
        let cache = ControllerCache::start(self.client.clone());
        cache
            .wait_until_ready()
            .await
            .context("Controller caches did not sync")?;
        let fetcher = ControllerFetcher::new(Arc::new(cache), self.cluster.clone());
        let capping = CappingProcessor::new(LimitRangeCalculator::new(self.cluster.clone()));
        Ok(PodHandler::new(
            MpaMatcher::new(self.cluster.clone(), fetcher),
            RecommendationProvider::new(capping),
            features,
        ))
    }
}
