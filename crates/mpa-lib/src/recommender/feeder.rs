//! Keeps the cluster model in sync with the API server and the metrics source

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::client::{MetricsClient, MpaClient, PodClient};
use crate::crd::{condition_types, MultidimPodAutoscaler};
use crate::error::Result;
use crate::model::{ClusterState, PodPhase};
use crate::models::{ContainerId, MpaId, OomInfo, PodId, ResourceAmount, ResourceName};
use crate::policy::container_requests_and_limits;
use crate::target::{pod_labels, ControllerFetcher, ControllerKey, Selector};

/// Name under which a recommender serves MPAs that do not pick one
pub const DEFAULT_RECOMMENDER_NAME: &str = "default";

/// Whether the recommender called `recommender_name` is responsible for the MPA
pub fn serves(object: &MultidimPodAutoscaler, recommender_name: &str) -> bool {
    if object.spec.recommenders.is_empty() {
        return recommender_name == DEFAULT_RECOMMENDER_NAME;
    }
    object
        .spec
        .recommenders
        .iter()
        .any(|r| r.name == recommender_name)
}

fn pod_id(pod: &Pod) -> PodId {
    PodId::new(pod.namespace().unwrap_or_default(), pod.name_any())
}

/// Samples accepted and dropped by one metrics load
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SampleStats {
    pub added: usize,
    pub dropped: usize,
}

/// Finds OOM kills in container statuses that were not reported before
#[derive(Debug, Default)]
struct OomObserver {
    seen: HashSet<(ContainerId, DateTime<Utc>)>,
}

impl OomObserver {
    fn observe(&mut self, pod: &Pod) -> Vec<OomInfo> {
        let id = pod_id(pod);
        let statuses = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref());
        let mut ooms = Vec::new();
        for status in statuses.into_iter().flatten() {
            let Some(terminated) = status.last_state.as_ref().and_then(|s| s.terminated.as_ref())
            else {
                continue;
            };
            if terminated.reason.as_deref() != Some("OOMKilled") {
                continue;
            }
            let Some(finished) = terminated.finished_at.as_ref().map(|t| t.0) else {
                continue;
            };
            let container = ContainerId::new(id.clone(), &status.name);
            if !self.seen.insert((container.clone(), finished)) {
                continue;
            }
            let memory = pod
                .spec
                .iter()
                .flat_map(|s| s.containers.iter())
                .find(|c| c.name == status.name)
                .and_then(|c| {
                    container_requests_and_limits(c)
                        .0
                        .get(&ResourceName::Memory)
                        .copied()
                })
                .unwrap_or(ResourceAmount::ZERO);
            ooms.push(OomInfo {
                timestamp: finished,
                memory,
                container,
            });
        }
        ooms
    }

    fn retain_pods(&mut self, live: &HashSet<PodId>) {
        self.seen.retain(|(container, _)| live.contains(&container.pod_id));
    }
}

/// Loads MPAs, pods, usage and checkpoints into a [`ClusterState`]
pub struct ClusterStateFeeder {
    mpas: Arc<dyn MpaClient>,
    pods: Arc<dyn PodClient>,
    metrics: Arc<dyn MetricsClient>,
    fetcher: ControllerFetcher,
    recommender_name: String,
    namespace: Option<String>,
    ooms: OomObserver,
    pending_ooms: Vec<OomInfo>,
}

impl ClusterStateFeeder {
    pub fn new(
        mpas: Arc<dyn MpaClient>,
        pods: Arc<dyn PodClient>,
        metrics: Arc<dyn MetricsClient>,
        fetcher: ControllerFetcher,
        recommender_name: impl Into<String>,
        namespace: Option<String>,
    ) -> Self {
        Self {
            mpas,
            pods,
            metrics,
            fetcher,
            recommender_name: recommender_name.into(),
            namespace,
            ooms: OomObserver::default(),
            pending_ooms: Vec::new(),
        }
    }

    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Selector of the MPA's target, or the reason the target is unsupported
    async fn target_selector(&self, object: &MultidimPodAutoscaler) -> std::result::Result<Selector, String> {
        let target = object
            .spec
            .scale_target_ref
            .as_ref()
            .ok_or_else(|| "Cannot read scaleTargetRef. Reason: scaleTargetRef is not set".to_string())?;
        let key = ControllerKey::new(
            object.namespace().unwrap_or_default(),
            &target.kind,
            &target.name,
            target.api_version.clone(),
        );
        let selector = self
            .fetcher
            .selector_for(&key)
            .await
            .map_err(|e| format!("Cannot read scaleTargetRef. Reason: {}", e))?;
        match self.fetcher.find_topmost_well_known_or_scalable(&key).await {
            Ok(Some(topmost)) if topmost.kind == key.kind && topmost.name == key.name => Ok(selector),
            Ok(_) => Err("The scaleTargetRef controller has a parent but it should point to a \
                 topmost well-known or scalable controller"
                .to_string()),
            Err(e) => Err(format!(
                "Error checking if target is a topmost well-known or scalable controller: {}",
                e
            )),
        }
    }

    /// Refreshes the served MPAs and returns the ids of every MPA object,
    /// served or not
    async fn refresh_mpas(&mut self, state: &mut ClusterState) -> Result<HashSet<MpaId>> {
        let objects = self.mpas.list_mpas(self.namespace()).await?;
        let existing: HashSet<MpaId> = objects.iter().map(|o| o.id()).collect();

        let mut observed = Vec::new();
        let mut served = HashSet::new();
        for object in objects {
            let id = object.id();
            if !serves(&object, &self.recommender_name) {
                debug!(mpa = %id, recommender = %self.recommender_name, "Skipping MPA served by another recommender");
                continue;
            }
            let (selector, unsupported) = match self.target_selector(&object).await {
                Ok(selector) => (selector, None),
                Err(reason) => {
                    warn!(mpa = %id, reason = %reason, "Unsupported scaleTargetRef");
                    (Selector::nothing(), Some(reason))
                }
            };
            if let Err(e) = state.add_or_update_mpa(&object, selector) {
                warn!(mpa = %id, error = %e, "Failed to add MPA to the cluster state");
                continue;
            }
            if let Some(mpa) = state.mpa_mut(&id) {
                match unsupported {
                    Some(message) => mpa.set_condition(
                        condition_types::CONFIG_UNSUPPORTED,
                        true,
                        "ConfigUnsupported",
                        &message,
                    ),
                    None => {
                        mpa.remove_condition(condition_types::CONFIG_UNSUPPORTED);
                        mpa.remove_condition(condition_types::CONFIG_DEPRECATED);
                    }
                }
            }
            served.insert(id);
            observed.push(object);
        }

        for id in state.mpa_ids() {
            if served.contains(&id) {
                continue;
            }
            if let Err(e) = state.delete_mpa(&id) {
                warn!(mpa = %id, error = %e, "Failed to delete MPA from the cluster state");
            } else {
                info!(mpa = %id, "Deleted MPA from the cluster state");
            }
        }
        state.set_observed_mpas(observed);
        Ok(existing)
    }

    /// Synchronizes the served MPAs of the cluster state with the API server
    pub async fn load_mpas(&mut self, state: &mut ClusterState) -> Result<()> {
        self.refresh_mpas(state).await.map(|_| ())
    }

    /// Synchronizes pods and their container requests, and picks up OOM
    /// kills to be recorded with the next metrics load
    pub async fn load_pods(&mut self, state: &mut ClusterState) -> Result<()> {
        let pods = self.pods.list_pods(self.namespace()).await?;
        let live: HashSet<PodId> = pods.iter().map(pod_id).collect();

        let stale: Vec<PodId> = state
            .pods()
            .filter(|p| !live.contains(&p.id))
            .map(|p| p.id.clone())
            .collect();
        for id in &stale {
            state.delete_pod(id);
        }

        for pod in &pods {
            let id = pod_id(pod);
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .map(PodPhase::parse)
                .unwrap_or_default();
            state.add_or_update_pod(id.clone(), pod_labels(pod), phase);
            for container in pod.spec.iter().flat_map(|s| s.containers.iter()) {
                let (requests, _) = container_requests_and_limits(container);
                let container_id = ContainerId::new(id.clone(), &container.name);
                if let Err(e) = state.add_or_update_container(&container_id, requests) {
                    warn!(container = %container_id, error = %e, "Failed to add container");
                }
            }
            let ooms = self.ooms.observe(pod);
            self.pending_ooms.extend(ooms);
        }
        self.ooms.retain_pods(&live);
        debug!(pods = pods.len(), deleted = stale.len(), "Loaded pods");
        Ok(())
    }

    /// Feeds the latest usage snapshots and pending OOM kills into the model
    pub async fn load_real_time_metrics(&mut self, state: &mut ClusterState) -> Result<SampleStats> {
        let snapshots = self.metrics.container_metrics(self.namespace()).await?;
        let mut stats = SampleStats::default();
        for snapshot in &snapshots {
            for sample in snapshot.samples() {
                match state.add_sample(&sample) {
                    Ok(true) => stats.added += 1,
                    Ok(false) => stats.dropped += 1,
                    Err(e) => {
                        debug!(container = %sample.container, error = %e, "Dropping sample");
                        stats.dropped += 1;
                    }
                }
            }
        }

        for oom in self.pending_ooms.drain(..) {
            match state.record_oom(&oom.container, oom.timestamp, oom.memory) {
                Ok(()) => info!(container = %oom.container, at = %oom.timestamp, "Recorded OOM kill"),
                Err(e) => warn!(container = %oom.container, error = %e, "Failed to record OOM kill"),
            }
        }

        debug!(
            snapshots = snapshots.len(),
            added = stats.added,
            dropped = stats.dropped,
            "Loaded real time metrics"
        );
        Ok(stats)
    }

    /// Restores checkpointed history of every served MPA. Errors on single
    /// checkpoints are logged and skipped.
    pub async fn init_from_checkpoints(&mut self, state: &mut ClusterState) -> Result<()> {
        info!("Initializing cluster state from checkpoints");
        self.load_mpas(state).await?;

        let namespaces: BTreeSet<String> = state.mpas().map(|m| m.id.namespace.clone()).collect();
        for namespace in namespaces {
            let checkpoints = match self.mpas.list_checkpoints(Some(&namespace)).await {
                Ok(checkpoints) => checkpoints,
                Err(e) => {
                    error!(namespace = %namespace, error = %e, "Cannot list checkpoints");
                    continue;
                }
            };
            for checkpoint in checkpoints {
                let id = MpaId::new(&namespace, &checkpoint.spec.mpa_object_name);
                if state.mpa(&id).is_none() {
                    continue;
                }
                let Some(status) = checkpoint.status.as_ref() else {
                    continue;
                };
                match state.load_checkpoint(&id, &checkpoint.spec.container_name, status) {
                    Ok(()) => debug!(checkpoint = %checkpoint.name_any(), mpa = %id, "Loaded checkpoint"),
                    Err(e) => error!(
                        checkpoint = %checkpoint.name_any(),
                        mpa = %id,
                        error = %e,
                        "Error loading checkpoint"
                    ),
                }
            }
        }
        Ok(())
    }

    /// Deletes checkpoints whose MPA object no longer exists. Returns the
    /// number of deleted checkpoints.
    pub async fn garbage_collect_checkpoints(&mut self, state: &mut ClusterState) -> Result<usize> {
        let existing = self.refresh_mpas(state).await?;
        let checkpoints = self.mpas.list_checkpoints(self.namespace()).await?;
        let mut deleted = 0;
        for checkpoint in checkpoints {
            let namespace = checkpoint.namespace().unwrap_or_default();
            let id = MpaId::new(&namespace, &checkpoint.spec.mpa_object_name);
            if existing.contains(&id) {
                continue;
            }
            let name = checkpoint.name_any();
            match self.mpas.delete_checkpoint(&namespace, &name).await {
                Ok(()) => {
                    deleted += 1;
                    info!(checkpoint = %name, namespace = %namespace, "Deleted orphaned checkpoint");
                }
                Err(e) => error!(checkpoint = %name, namespace = %namespace, error = %e, "Failed to delete checkpoint"),
            }
        }
        Ok(deleted)
    }
}
