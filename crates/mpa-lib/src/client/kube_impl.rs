//! Client implementations backed by the Kubernetes API

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::autoscaling::v1::Scale;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{
    Event, EventSource, LimitRange, ObjectReference, Pod, ReplicationController,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, MicroTime, ObjectMeta, Time};
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, EvictParams, ListParams, Patch, PatchParams,
    PostParams,
};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::*;
use crate::error::Error;
use crate::models::{ContainerId, PodId, ResourceName, Resources};
use crate::quantity::parse_lenient;
use crate::retry::{retry_with_backoff, RetryConfig};

const FIELD_MANAGER: &str = "multidim-pod-autoscaler";

/// Direct API access for everything except well-known controllers
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    retry: RetryConfig,
    component: String,
    scale_mappings: std::sync::Arc<RwLock<HashMap<(String, String), Vec<ScaleMapping>>>>,
}

impl KubeCluster {
    /// `component` is reported as the source of recorded events
    pub fn new(client: Client, component: impl Into<String>) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
            component: component.into(),
            scale_mappings: Default::default(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn mpas(&self, namespace: Option<&str>) -> Api<MultidimPodAutoscaler> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn checkpoints(&self, namespace: Option<&str>) -> Api<MultidimPodAutoscalerCheckpoint> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn scale_api(&self, mapping: &ScaleMapping, namespace: &str) -> Api<DynamicObject> {
        let resource = ApiResource {
            group: mapping.group.clone(),
            version: mapping.version.clone(),
            api_version: if mapping.group.is_empty() {
                mapping.version.clone()
            } else {
                format!("{}/{}", mapping.group, mapping.version)
            },
            kind: mapping.kind.clone(),
            plural: mapping.plural.clone(),
        };
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }
}

#[async_trait]
impl MpaClient for KubeCluster {
    async fn list_mpas(&self, namespace: Option<&str>) -> Result<Vec<MultidimPodAutoscaler>> {
        let api = self.mpas(namespace);
        let list = retry_with_backoff(&self.retry, "list_mpas", || {
            let api = api.clone();
            async move { Ok(api.list(&ListParams::default()).await?) }
        })
        .await?;
        Ok(list.items)
    }

    async fn patch_mpa_status(
        &self,
        id: &MpaId,
        status: &MultidimPodAutoscalerStatus,
    ) -> Result<()> {
        let api = self.mpas(Some(&id.namespace));
        let patch = json!({ "status": status });
        retry_with_backoff(&self.retry, "patch_mpa_status", || {
            let api = api.clone();
            let patch = patch.clone();
            async move {
                api.patch_status(&id.mpa_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            }
        })
        .await
    }

    async fn list_checkpoints(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<MultidimPodAutoscalerCheckpoint>> {
        let api = self.checkpoints(namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn save_checkpoint(&self, checkpoint: &MultidimPodAutoscalerCheckpoint) -> Result<()> {
        let namespace = checkpoint
            .namespace()
            .ok_or_else(|| Error::checkpoint("checkpoint has no namespace"))?;
        let name = checkpoint.name_any();
        let api = self.checkpoints(Some(&namespace));
        let patch = json!({ "status": checkpoint.status });
        match api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(checkpoint = %name, "Creating checkpoint");
                api.create(&PostParams::default(), checkpoint).await?;
                api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_checkpoint(&self, namespace: &str, name: &str) -> Result<()> {
        self.checkpoints(Some(namespace))
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ScaleClient for KubeCluster {
    async fn mappings(&self, group: &str, kind: &str) -> Result<Vec<ScaleMapping>> {
        let key = (group.to_string(), kind.to_string());
        if let Some(cached) = self.scale_mappings.read().await.get(&key) {
            return Ok(cached.clone());
        }

        let api_group = kube::discovery::group(&self.client, group).await?;
        let mut mappings = Vec::new();
        let preferred = api_group.preferred_version_or_latest().to_string();
        let mut versions: Vec<String> = api_group.versions().map(str::to_string).collect();
        versions.sort_by_key(|v| *v != preferred);
        for version in versions {
            for (resource, caps) in api_group.versioned_resources(&version) {
                if resource.kind != kind {
                    continue;
                }
                let has_scale = caps
                    .subresources
                    .iter()
                    .any(|(sub, _)| sub.plural.ends_with("/scale") || sub.plural == "scale");
                if has_scale {
                    mappings.push(ScaleMapping {
                        group: resource.group.clone(),
                        version: resource.version.clone(),
                        kind: resource.kind.clone(),
                        plural: resource.plural.clone(),
                    });
                }
            }
        }

        self.scale_mappings
            .write()
            .await
            .insert(key, mappings.clone());
        Ok(mappings)
    }

    async fn get_scale(
        &self,
        mapping: &ScaleMapping,
        namespace: &str,
        name: &str,
    ) -> Result<Scale> {
        Ok(self.scale_api(mapping, namespace).get_scale(name).await?)
    }

    async fn update_scale(
        &self,
        mapping: &ScaleMapping,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<Scale> {
        let patch = json!({ "spec": { "replicas": replicas } });
        Ok(self
            .scale_api(mapping, namespace)
            .patch_scale(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }
}

#[async_trait]
impl PodClient for KubeCluster {
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<Pod>> {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn evict_pod(&self, pod: &Pod) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        api.evict(&pod.name_any(), &EvictParams::default())
            .await
            .map_err(|e| {
                let err = Error::from(e);
                if err.is_too_many_requests() {
                    err
                } else {
                    Error::eviction(format!("{}/{}: {}", namespace, pod.name_any(), err))
                }
            })?;
        Ok(())
    }

    async fn resize_pod(&self, pod: &Pod, patch: &json_patch::Patch) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        api.patch_subresource(
            "resize",
            &pod.name_any(),
            &PatchParams::default(),
            &Patch::<()>::Json(patch.clone()),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LimitRangeClient for KubeCluster {
    async fn list_limit_ranges(&self, namespace: &str) -> Result<Vec<LimitRange>> {
        let api: Api<LimitRange> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

#[async_trait]
impl LeaseClient for KubeCluster {
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_lease(&self, lease: &Lease) -> Result<()> {
        let namespace = lease
            .namespace()
            .ok_or_else(|| Error::validation("lease has no namespace"))?;
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &lease.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(lease),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EventRecorder for KubeCluster {
    async fn record(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: &str,
    ) {
        let namespace = object
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let now = Utc::now();
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!(
                    "{}.",
                    object.name.as_deref().unwrap_or("object")
                )),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            involved_object: object.clone(),
            type_: Some(type_.as_str().to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                host: None,
            }),
            reporting_component: Some(self.component.clone()),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            event_time: Some(MicroTime(now)),
            count: Some(1),
            ..Default::default()
        };
        let api: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
        if let Err(e) = api.create(&PostParams::default(), &event).await {
            warn!(reason = reason, error = %e, "Failed to record event");
        }
    }
}

#[async_trait]
impl MetricsClient for KubeCluster {
    async fn container_metrics(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<ContainerMetricsSnapshot>> {
        let resource = ApiResource {
            group: "metrics.k8s.io".to_string(),
            version: "v1beta1".to_string(),
            api_version: "metrics.k8s.io/v1beta1".to_string(),
            kind: "PodMetrics".to_string(),
            plural: "pods".to_string(),
        };
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };
        let list = api.list(&ListParams::default()).await?;

        let mut snapshots = Vec::new();
        for pod_metrics in list.items {
            let pod_id = PodId::new(
                pod_metrics.namespace().unwrap_or_default(),
                pod_metrics.name_any(),
            );
            snapshots.extend(snapshots_from_pod_metrics(pod_id, &pod_metrics.data));
        }
        Ok(snapshots)
    }
}

/// Converts the body of a `PodMetrics` object into per-container snapshots
pub(crate) fn snapshots_from_pod_metrics(
    pod_id: PodId,
    data: &serde_json::Value,
) -> Vec<ContainerMetricsSnapshot> {
    let snapshot_time = data["timestamp"]
        .as_str()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let window_secs = data["window"]
        .as_str()
        .and_then(parse_go_duration_secs)
        .unwrap_or(0);

    let Some(containers) = data["containers"].as_array() else {
        return Vec::new();
    };
    containers
        .iter()
        .filter_map(|c| {
            let name = c["name"].as_str()?;
            let mut usage = Resources::new();
            for resource in ResourceName::ALL {
                if let Some(q) = c["usage"][resource.as_str()].as_str() {
                    match parse_lenient(resource, q) {
                        Ok(amount) => {
                            usage.insert(resource, amount);
                        }
                        Err(e) => debug!(container = name, error = %e, "Skipping usage"),
                    }
                }
            }
            Some(ContainerMetricsSnapshot {
                id: ContainerId::new(pod_id.clone(), name),
                snapshot_time,
                snapshot_window_secs: window_secs,
                usage,
            })
        })
        .collect()
}

/// Parses durations such as `30s`, `1m0s` or `30.5s` into whole seconds
fn parse_go_duration_secs(input: &str) -> Option<i64> {
    let mut total = 0f64;
    let mut number = String::new();
    for c in input.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let value: f64 = number.parse().ok()?;
        number.clear();
        total += match c {
            'h' => value * 3600.0,
            'm' => value * 60.0,
            's' => value,
            _ => return None,
        };
    }
    if !number.is_empty() {
        return None;
    }
    Some(total.round() as i64)
}

/// Informer caches for the well-known controller kinds
#[derive(Clone)]
pub struct ControllerCache {
    deployments: Store<Deployment>,
    stateful_sets: Store<StatefulSet>,
    daemon_sets: Store<DaemonSet>,
    replica_sets: Store<ReplicaSet>,
    replication_controllers: Store<ReplicationController>,
    jobs: Store<Job>,
    cron_jobs: Store<CronJob>,
}

impl ControllerCache {
    /// Starts one watcher per kind. Must be called inside a tokio runtime.
    pub fn start(client: Client) -> Self {
        Self {
            deployments: spawn_store(Api::all(client.clone())),
            stateful_sets: spawn_store(Api::all(client.clone())),
            daemon_sets: spawn_store(Api::all(client.clone())),
            replica_sets: spawn_store(Api::all(client.clone())),
            replication_controllers: spawn_store(Api::all(client.clone())),
            jobs: spawn_store(Api::all(client.clone())),
            cron_jobs: spawn_store(Api::all(client)),
        }
    }

    /// Resolves once every cache has completed its initial list
    pub async fn wait_until_ready(&self) -> Result<()> {
        futures::try_join!(
            self.deployments.wait_until_ready(),
            self.stateful_sets.wait_until_ready(),
            self.daemon_sets.wait_until_ready(),
            self.replica_sets.wait_until_ready(),
            self.replication_controllers.wait_until_ready(),
            self.jobs.wait_until_ready(),
            self.cron_jobs.wait_until_ready(),
        )
        .map_err(|e| Error::config(format!("controller cache stopped before syncing: {}", e)))?;
        Ok(())
    }
}

fn spawn_store<K>(api: Api<K>) -> Store<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .applied_objects();
    tokio::spawn(async move {
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            if let Err(e) = event {
                warn!(kind = %K::kind(&Default::default()), error = %e, "Informer watch error");
            }
        }
    });
    reader
}

fn cached<K>(store: &Store<K>, key: &ControllerKey) -> Option<std::sync::Arc<K>>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    store.get(&ObjectRef::new(&key.name).within(&key.namespace))
}

fn info_of<K: Resource>(
    object: &K,
    selector: Option<LabelSelector>,
    configured_replicas: Option<i32>,
) -> ControllerInfo {
    ControllerInfo {
        owner_references: object.meta().owner_references.clone().unwrap_or_default(),
        selector,
        configured_replicas,
    }
}

#[async_trait]
impl ControllerClient for ControllerCache {
    async fn get_controller(&self, key: &ControllerKey) -> Result<Option<ControllerInfo>> {
        let info = match key.kind.as_str() {
            "Deployment" => cached(&self.deployments, key).map(|d| {
                let spec = d.spec.as_ref();
                info_of(
                    d.as_ref(),
                    spec.map(|s| s.selector.clone()),
                    spec.and_then(|s| s.replicas),
                )
            }),
            "StatefulSet" => cached(&self.stateful_sets, key).map(|s| {
                let spec = s.spec.as_ref();
                info_of(
                    s.as_ref(),
                    spec.map(|s| s.selector.clone()),
                    spec.and_then(|s| s.replicas),
                )
            }),
            "DaemonSet" => cached(&self.daemon_sets, key).map(|d| {
                info_of(
                    d.as_ref(),
                    d.spec.as_ref().map(|s| s.selector.clone()),
                    d.status.as_ref().map(|s| s.number_ready),
                )
            }),
            "ReplicaSet" => cached(&self.replica_sets, key).map(|r| {
                let spec = r.spec.as_ref();
                info_of(
                    r.as_ref(),
                    spec.map(|s| s.selector.clone()),
                    spec.and_then(|s| s.replicas),
                )
            }),
            "ReplicationController" => cached(&self.replication_controllers, key).map(|r| {
                let spec = r.spec.as_ref();
                let selector = spec.and_then(|s| s.selector.clone()).map(|labels| LabelSelector {
                    match_labels: Some(labels),
                    ..Default::default()
                });
                info_of(r.as_ref(), selector, spec.and_then(|s| s.replicas))
            }),
            "Job" => cached(&self.jobs, key).map(|j| {
                info_of(
                    j.as_ref(),
                    j.spec.as_ref().and_then(|s| s.selector.clone()),
                    j.status.as_ref().and_then(|s| s.active),
                )
            }),
            "CronJob" => cached(&self.cron_jobs, key).map(|c| {
                let selector = c
                    .spec
                    .as_ref()
                    .and_then(|s| s.job_template.spec.as_ref())
                    .and_then(|s| s.selector.clone());
                info_of(c.as_ref(), selector, None)
            }),
            _ => None,
        };
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_go_duration() {
        assert_eq!(parse_go_duration_secs("30s"), Some(30));
        assert_eq!(parse_go_duration_secs("1m0s"), Some(60));
        assert_eq!(parse_go_duration_secs("1h2m3s"), Some(3723));
        assert_eq!(parse_go_duration_secs("5x"), None);
        assert_eq!(parse_go_duration_secs("12"), None);
    }

    #[test]
    fn test_snapshots_from_pod_metrics() {
        let data = json!({
            "timestamp": "2024-01-01T00:00:00Z",
            "window": "30s",
            "containers": [
                {"name": "app", "usage": {"cpu": "250m", "memory": "128Mi"}},
                {"name": "sidecar", "usage": {"cpu": "1500000n"}}
            ]
        });
        let snapshots = snapshots_from_pod_metrics(PodId::new("default", "web-1"), &data);
        assert_eq!(snapshots.len(), 2);

        let app = &snapshots[0];
        assert_eq!(app.id.container_name, "app");
        assert_eq!(app.snapshot_window_secs, 30);
        assert_eq!(app.usage[&ResourceName::Cpu].0, 250);
        assert_eq!(app.usage[&ResourceName::Memory].0, 128 * 1024 * 1024);

        // 1.5m rounds up to the millicore grain
        let sidecar = &snapshots[1];
        assert_eq!(sidecar.usage[&ResourceName::Cpu].0, 2);
        assert!(!sidecar.usage.contains_key(&ResourceName::Memory));
    }
}
