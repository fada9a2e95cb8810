//! In-memory implementation of every control-plane seam, for tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::autoscaling::v1::{Scale, ScaleSpec, ScaleStatus};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{LimitRange, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use super::*;
use crate::error::{api_error, Error};
use crate::models::MpaId;

type ObjectKey = (String, String, String);

fn object_key(namespace: &str, kind: &str, name: &str) -> ObjectKey {
    (namespace.to_string(), kind.to_string(), name.to_string())
}

/// A whole cluster held in memory. Implements every client trait.
#[derive(Default)]
pub struct FakeCluster {
    pub mpas: Mutex<Vec<MultidimPodAutoscaler>>,
    pub status_patches: Mutex<Vec<(MpaId, MultidimPodAutoscalerStatus)>>,
    pub checkpoints: Mutex<Vec<MultidimPodAutoscalerCheckpoint>>,
    pub deleted_checkpoints: Mutex<Vec<String>>,
    pub controllers: Mutex<HashMap<ObjectKey, ControllerInfo>>,
    pub scales: Mutex<HashMap<ObjectKey, Scale>>,
    pub scalable_kinds: Mutex<HashSet<String>>,
    pub scale_updates: Mutex<Vec<(String, i32)>>,
    pub pods: Mutex<Vec<Pod>>,
    pub evicted: Mutex<Vec<String>>,
    pub evictions_to_fail: Mutex<HashSet<String>>,
    pub resized: Mutex<Vec<(String, json_patch::Patch)>>,
    pub limit_ranges: Mutex<Vec<LimitRange>>,
    pub leases: Mutex<HashMap<(String, String), Lease>>,
    pub events: Mutex<Vec<(String, String)>>,
    pub metrics: Mutex<Vec<ContainerMetricsSnapshot>>,
    pub get_scale_calls: AtomicUsize,
    /// Number of upcoming `list_pods` calls answered with a 503
    pub pod_list_failures: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mpa(&self, mpa: MultidimPodAutoscaler) {
        self.mpas.lock().unwrap().push(mpa);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().push(pod);
    }

    pub fn add_controller(&self, namespace: &str, kind: &str, name: &str, info: ControllerInfo) {
        self.controllers
            .lock()
            .unwrap()
            .insert(object_key(namespace, kind, name), info);
    }

    /// Registers a scalable object of a custom kind
    pub fn add_scalable(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
        replicas: i32,
        selector: &str,
        owners: Vec<OwnerReference>,
    ) {
        self.scalable_kinds.lock().unwrap().insert(kind.to_string());
        let scale = Scale {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: (!owners.is_empty()).then_some(owners),
                ..Default::default()
            },
            spec: Some(ScaleSpec {
                replicas: Some(replicas),
            }),
            status: Some(ScaleStatus {
                replicas,
                selector: Some(selector.to_string()),
            }),
        };
        self.scales
            .lock()
            .unwrap()
            .insert(object_key(namespace, kind, name), scale);
    }

    pub fn evicted(&self) -> Vec<String> {
        self.evicted.lock().unwrap().clone()
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(reason, _)| reason.clone())
            .collect()
    }
}

#[async_trait]
impl MpaClient for FakeCluster {
    async fn list_mpas(&self, namespace: Option<&str>) -> Result<Vec<MultidimPodAutoscaler>> {
        Ok(self
            .mpas
            .lock()
            .unwrap()
            .iter()
            .filter(|m| namespace.map_or(true, |ns| m.namespace().as_deref() == Some(ns)))
            .cloned()
            .collect())
    }

    async fn patch_mpa_status(
        &self,
        id: &MpaId,
        status: &MultidimPodAutoscalerStatus,
    ) -> Result<()> {
        let mut mpas = self.mpas.lock().unwrap();
        let mpa = mpas
            .iter_mut()
            .find(|m| m.id() == *id)
            .ok_or_else(|| api_error(404, "NotFound"))?;
        mpa.status = Some(status.clone());
        self.status_patches
            .lock()
            .unwrap()
            .push((id.clone(), status.clone()));
        Ok(())
    }

    async fn list_checkpoints(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<MultidimPodAutoscalerCheckpoint>> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap()
            .iter()
            .filter(|c| namespace.map_or(true, |ns| c.namespace().as_deref() == Some(ns)))
            .cloned()
            .collect())
    }

    async fn save_checkpoint(&self, checkpoint: &MultidimPodAutoscalerCheckpoint) -> Result<()> {
        let mut checkpoints = self.checkpoints.lock().unwrap();
        checkpoints.retain(|c| {
            c.name_any() != checkpoint.name_any() || c.namespace() != checkpoint.namespace()
        });
        checkpoints.push(checkpoint.clone());
        Ok(())
    }

    async fn delete_checkpoint(&self, namespace: &str, name: &str) -> Result<()> {
        let mut checkpoints = self.checkpoints.lock().unwrap();
        checkpoints.retain(|c| c.name_any() != name || c.namespace().as_deref() != Some(namespace));
        self.deleted_checkpoints
            .lock()
            .unwrap()
            .push(format!("{}/{}", namespace, name));
        Ok(())
    }
}

#[async_trait]
impl ScaleClient for FakeCluster {
    async fn mappings(&self, group: &str, kind: &str) -> Result<Vec<ScaleMapping>> {
        let known = self.scalable_kinds.lock().unwrap().contains(kind)
            || crate::target::WELL_KNOWN_KINDS.contains(&kind);
        if !known {
            return Ok(Vec::new());
        }
        Ok(vec![ScaleMapping {
            group: group.to_string(),
            version: "v1".to_string(),
            kind: kind.to_string(),
            plural: format!("{}s", kind.to_lowercase()),
        }])
    }

    async fn get_scale(
        &self,
        mapping: &ScaleMapping,
        namespace: &str,
        name: &str,
    ) -> Result<Scale> {
        self.get_scale_calls.fetch_add(1, Ordering::SeqCst);
        self.scales
            .lock()
            .unwrap()
            .get(&object_key(namespace, &mapping.kind, name))
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound"))
    }

    async fn update_scale(
        &self,
        mapping: &ScaleMapping,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<Scale> {
        let mut scales = self.scales.lock().unwrap();
        let scale = scales
            .get_mut(&object_key(namespace, &mapping.kind, name))
            .ok_or_else(|| api_error(404, "NotFound"))?;
        scale.spec = Some(ScaleSpec {
            replicas: Some(replicas),
        });
        self.scale_updates
            .lock()
            .unwrap()
            .push((format!("{}/{}", namespace, name), replicas));
        Ok(scale.clone())
    }
}

#[async_trait]
impl ControllerClient for FakeCluster {
    async fn get_controller(&self, key: &ControllerKey) -> Result<Option<ControllerInfo>> {
        Ok(self
            .controllers
            .lock()
            .unwrap()
            .get(&object_key(&key.namespace, &key.kind, &key.name))
            .cloned())
    }
}

#[async_trait]
impl PodClient for FakeCluster {
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<Pod>> {
        let failing = self
            .pod_list_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(api_error(503, "ServiceUnavailable"));
        }
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| namespace.map_or(true, |ns| p.namespace().as_deref() == Some(ns)))
            .cloned()
            .collect())
    }

    async fn evict_pod(&self, pod: &Pod) -> Result<()> {
        let name = pod.name_any();
        if self.evictions_to_fail.lock().unwrap().contains(&name) {
            return Err(api_error(429, "TooManyRequests"));
        }
        self.evicted.lock().unwrap().push(name);
        Ok(())
    }

    async fn resize_pod(&self, pod: &Pod, patch: &json_patch::Patch) -> Result<()> {
        self.resized
            .lock()
            .unwrap()
            .push((pod.name_any(), patch.clone()));
        Ok(())
    }
}

#[async_trait]
impl LimitRangeClient for FakeCluster {
    async fn list_limit_ranges(&self, namespace: &str) -> Result<Vec<LimitRange>> {
        Ok(self
            .limit_ranges
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LeaseClient for FakeCluster {
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>> {
        Ok(self
            .leases
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn apply_lease(&self, lease: &Lease) -> Result<()> {
        let namespace = lease
            .namespace()
            .ok_or_else(|| Error::validation("lease has no namespace"))?;
        self.leases
            .lock()
            .unwrap()
            .insert((namespace, lease.name_any()), lease.clone());
        Ok(())
    }
}

#[async_trait]
impl EventRecorder for FakeCluster {
    async fn record(
        &self,
        _object: &ObjectReference,
        _type_: EventType,
        reason: &str,
        message: &str,
    ) {
        self.events
            .lock()
            .unwrap()
            .push((reason.to_string(), message.to_string()));
    }
}

#[async_trait]
impl MetricsClient for FakeCluster {
    async fn container_metrics(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<ContainerMetricsSnapshot>> {
        Ok(self
            .metrics
            .lock()
            .unwrap()
            .iter()
            .filter(|m| namespace.map_or(true, |ns| m.id.pod_id.namespace == ns))
            .cloned()
            .collect())
    }
}
