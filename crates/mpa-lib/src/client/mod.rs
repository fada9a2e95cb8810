//! Control-plane seams
//!
//! Every read and write against the API server goes through one of these
//! traits so the recommender, updater and admission controller can be driven
//! by in-memory fakes in tests. [`kube_impl`] holds the implementations backed
//! by `kube::Api` and reflector caches.

pub mod kube_impl;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use k8s_openapi::api::autoscaling::v1::Scale;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{LimitRange, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};

use crate::crd::{
    MultidimPodAutoscaler, MultidimPodAutoscalerCheckpoint, MultidimPodAutoscalerStatus,
};
use crate::error::Result;
use crate::models::{ContainerMetricsSnapshot, MpaId};
use crate::target::ControllerKey;

/// Access to MPA objects and their checkpoints
#[async_trait]
pub trait MpaClient: Send + Sync {
    /// MPAs in `namespace`, or in all namespaces when `None`
    async fn list_mpas(&self, namespace: Option<&str>) -> Result<Vec<MultidimPodAutoscaler>>;

    /// Merge-patches the status sub-resource
    async fn patch_mpa_status(&self, id: &MpaId, status: &MultidimPodAutoscalerStatus)
        -> Result<()>;

    async fn list_checkpoints(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<MultidimPodAutoscalerCheckpoint>>;

    /// Writes the checkpoint status, creating the object when it does not exist
    async fn save_checkpoint(&self, checkpoint: &MultidimPodAutoscalerCheckpoint) -> Result<()>;

    async fn delete_checkpoint(&self, namespace: &str, name: &str) -> Result<()>;
}

/// REST mapping of a kind that may expose a scale sub-resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScaleMapping {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

/// Access to the scale sub-resource of arbitrary kinds
#[async_trait]
pub trait ScaleClient: Send + Sync {
    /// All REST mappings for `group`/`kind`, preferred version first
    async fn mappings(&self, group: &str, kind: &str) -> Result<Vec<ScaleMapping>>;

    async fn get_scale(&self, mapping: &ScaleMapping, namespace: &str, name: &str)
        -> Result<Scale>;

    async fn update_scale(
        &self,
        mapping: &ScaleMapping,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<Scale>;
}

/// Cached view of a well-known controller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerInfo {
    pub owner_references: Vec<OwnerReference>,
    pub selector: Option<LabelSelector>,
    /// Number of pods the controller is configured to run
    pub configured_replicas: Option<i32>,
}

/// Informer-backed lookups of well-known controllers
#[async_trait]
pub trait ControllerClient: Send + Sync {
    /// `Ok(None)` when the controller is not in the cache
    async fn get_controller(&self, key: &ControllerKey) -> Result<Option<ControllerInfo>>;
}

/// Pod reads and the two ways of changing a running pod
#[async_trait]
pub trait PodClient: Send + Sync {
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<Pod>>;

    /// Evicts through the eviction sub-resource so disruption budgets apply
    async fn evict_pod(&self, pod: &Pod) -> Result<()>;

    /// Applies a JSON patch through the `resize` sub-resource
    async fn resize_pod(&self, pod: &Pod, patch: &json_patch::Patch) -> Result<()>;
}

#[async_trait]
pub trait LimitRangeClient: Send + Sync {
    async fn list_limit_ranges(&self, namespace: &str) -> Result<Vec<LimitRange>>;
}

#[async_trait]
pub trait LeaseClient: Send + Sync {
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>>;

    /// Creates the lease or replaces its spec
    async fn apply_lease(&self, lease: &Lease) -> Result<()>;
}

/// Kubernetes event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// Emits events attached to an object. Failures are logged, never returned.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, object: &ObjectReference, type_: EventType, reason: &str, message: &str);
}

/// Usage snapshots from `metrics.k8s.io`
#[async_trait]
pub trait MetricsClient: Send + Sync {
    async fn container_metrics(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<ContainerMetricsSnapshot>>;
}

/// Object reference used when recording events about a pod
pub fn pod_reference(pod: &Pod) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Pod".to_string()),
        name: pod.metadata.name.clone(),
        namespace: pod.metadata.namespace.clone(),
        uid: pod.metadata.uid.clone(),
        ..Default::default()
    }
}

/// Object reference used when recording events about an MPA
pub fn mpa_reference(mpa: &MultidimPodAutoscaler) -> ObjectReference {
    ObjectReference {
        api_version: Some(format!("{}/{}", crate::crd::API_GROUP, crate::crd::API_VERSION)),
        kind: Some("MultidimPodAutoscaler".to_string()),
        name: mpa.metadata.name.clone(),
        namespace: mpa.metadata.namespace.clone(),
        uid: mpa.metadata.uid.clone(),
        ..Default::default()
    }
}
