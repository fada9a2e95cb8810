use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use kube::ResourceExt;
use tracing::{debug, info};

use super::aggregate::{AggregateContainerState, ContainerNameToAggregateStateMap, HistogramLayout};
use super::aggregations::AggregationsConfig;
use super::container::ContainerState;
use super::mpa::Mpa;
use crate::crd::{MultidimPodAutoscaler, MultidimPodAutoscalerCheckpointStatus};
use crate::error::{Error, Result};
use crate::models::{
    AggregateStateKey, ContainerId, ContainerUsageSample, ContainerUsageSampleWithKey, MpaId,
    PodId, ResourceAmount, ResourceName, Resources,
};
use crate::target::selector::{Labels, Selector};

/// How long an MPA may go without a recommendation before it is reported
pub const RECOMMENDATION_MISSING_MAX_DURATION: Duration = Duration::minutes(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// Live state of one pod
#[derive(Debug, Clone)]
pub struct PodState {
    pub id: PodId,
    labels_key: String,
    pub containers: BTreeMap<String, ContainerState>,
    pub phase: PodPhase,
}

impl PodState {
    fn new(id: PodId) -> Self {
        Self {
            id,
            labels_key: String::new(),
            containers: BTreeMap::new(),
            phase: PodPhase::default(),
        }
    }

    pub fn labels_key(&self) -> &str {
        &self.labels_key
    }
}

fn labels_key(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Everything the recommender knows about the cluster: pods, containers,
/// MPA objects and the aggregated usage of their containers
#[derive(Debug)]
pub struct ClusterState {
    pods: HashMap<PodId, PodState>,
    mpas: HashMap<MpaId, Mpa>,
    /// MPAs without a recommendation, mapped to when that was last reported
    empty_mpas: HashMap<MpaId, DateTime<Utc>>,
    observed_mpas: Vec<MultidimPodAutoscaler>,
    aggregate_states: HashMap<AggregateStateKey, AggregateContainerState>,
    label_sets: HashMap<String, Labels>,
    last_aggregate_gc: Option<DateTime<Utc>>,
    gc_interval: Duration,
    config: AggregationsConfig,
    layout: HistogramLayout,
}

impl ClusterState {
    pub fn new(config: AggregationsConfig, gc_interval: std::time::Duration) -> Result<Self> {
        let layout = HistogramLayout::new(&config)?;
        Ok(Self {
            pods: HashMap::new(),
            mpas: HashMap::new(),
            empty_mpas: HashMap::new(),
            observed_mpas: Vec::new(),
            aggregate_states: HashMap::new(),
            label_sets: HashMap::new(),
            last_aggregate_gc: None,
            gc_interval: Duration::from_std(gc_interval).unwrap_or_else(|_| Duration::hours(1)),
            config,
            layout,
        })
    }

    pub fn config(&self) -> &AggregationsConfig {
        &self.config
    }

    pub fn layout(&self) -> &HistogramLayout {
        &self.layout
    }

    pub fn pods(&self) -> impl Iterator<Item = &PodState> {
        self.pods.values()
    }

    pub fn pod(&self, id: &PodId) -> Option<&PodState> {
        self.pods.get(id)
    }

    pub fn pod_labels(&self, pod: &PodState) -> Labels {
        self.label_sets
            .get(&pod.labels_key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn mpas(&self) -> impl Iterator<Item = &Mpa> {
        self.mpas.values()
    }

    pub fn mpa(&self, id: &MpaId) -> Option<&Mpa> {
        self.mpas.get(id)
    }

    pub fn mpa_mut(&mut self, id: &MpaId) -> Option<&mut Mpa> {
        self.mpas.get_mut(id)
    }

    pub fn mpa_ids(&self) -> Vec<MpaId> {
        let mut ids: Vec<MpaId> = self.mpas.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn observed_mpas(&self) -> &[MultidimPodAutoscaler] {
        &self.observed_mpas
    }

    pub fn set_observed_mpas(&mut self, mpas: Vec<MultidimPodAutoscaler>) {
        self.observed_mpas = mpas;
    }

    pub fn aggregate_state_count(&self) -> usize {
        self.aggregate_states.len()
    }

    pub fn aggregate_state(&self, key: &AggregateStateKey) -> Option<&AggregateContainerState> {
        self.aggregate_states.get(key)
    }

    /// Adds the pod or updates its labels and phase. A label change relinks
    /// its containers to the aggregations of the new label set.
    pub fn add_or_update_pod(&mut self, id: PodId, labels: Labels, phase: PodPhase) {
        let new_key = labels_key(&labels);
        self.label_sets.insert(new_key.clone(), labels);

        let existing = self.pods.get(&id).map(|p| p.labels_key.clone());
        let relink = match &existing {
            Some(old_key) if *old_key != new_key => {
                self.change_pod_count(&id.namespace, old_key, -1);
                true
            }
            Some(_) => false,
            None => true,
        };

        let pod = self
            .pods
            .entry(id.clone())
            .or_insert_with(|| PodState::new(id.clone()));
        pod.phase = phase;
        if relink {
            pod.labels_key = new_key.clone();
            let containers: Vec<String> = pod.containers.keys().cloned().collect();
            for container in containers {
                let key = AggregateStateKey {
                    namespace: id.namespace.clone(),
                    container_name: container,
                    labels_key: new_key.clone(),
                };
                self.ensure_aggregate_state(&key);
            }
            self.change_pod_count(&id.namespace, &new_key, 1);
        }
    }

    fn change_pod_count(&mut self, namespace: &str, labels_key: &str, delta: isize) {
        let labels = self.label_sets.get(labels_key).cloned().unwrap_or_default();
        for mpa in self.mpas.values_mut() {
            if mpa.id.namespace == namespace && mpa.pod_selector.matches(&labels) {
                mpa.pod_count = mpa.pod_count.saturating_add_signed(delta);
            }
        }
    }

    pub fn delete_pod(&mut self, id: &PodId) {
        if let Some(pod) = self.pods.remove(id) {
            self.change_pod_count(&id.namespace, &pod.labels_key, -1);
        }
    }

    pub fn container(&self, id: &ContainerId) -> Option<&ContainerState> {
        self.pods.get(&id.pod_id)?.containers.get(&id.container_name)
    }

    /// Adds a container to a known pod, or updates its request
    pub fn add_or_update_container(&mut self, id: &ContainerId, request: Resources) -> Result<()> {
        let pod = self
            .pods
            .get_mut(&id.pod_id)
            .ok_or_else(|| Error::unknown_key(id.pod_id.to_string()))?;
        if let Some(container) = pod.containers.get_mut(&id.container_name) {
            container.request = request;
            return Ok(());
        }
        pod.containers
            .insert(id.container_name.clone(), ContainerState::new(request));
        let key = self.aggregate_state_key(id)?;
        self.ensure_aggregate_state(&key);
        Ok(())
    }

    fn aggregate_state_key(&self, id: &ContainerId) -> Result<AggregateStateKey> {
        let pod = self
            .pods
            .get(&id.pod_id)
            .ok_or_else(|| Error::unknown_key(id.pod_id.to_string()))?;
        Ok(self.make_aggregate_state_key(pod, &id.container_name))
    }

    pub fn make_aggregate_state_key(&self, pod: &PodState, container: &str) -> AggregateStateKey {
        AggregateStateKey {
            namespace: pod.id.namespace.clone(),
            container_name: container.to_string(),
            labels_key: pod.labels_key.clone(),
        }
    }

    fn ensure_aggregate_state(&mut self, key: &AggregateStateKey) {
        if self.aggregate_states.contains_key(key) {
            return;
        }
        let mut state = AggregateContainerState::new(&self.layout, Utc::now());
        let labels = self
            .label_sets
            .get(&key.labels_key)
            .cloned()
            .unwrap_or_default();
        for mpa in self.mpas.values_mut() {
            mpa.use_aggregation_if_matching(key, &labels, &mut state);
        }
        self.aggregate_states.insert(key.clone(), state);
    }

    /// Adds a usage sample to its container. Returns `Ok(false)` when the
    /// sample was dropped as invalid or out of order.
    pub fn add_sample(&mut self, sample: &ContainerUsageSampleWithKey) -> Result<bool> {
        let key = self.aggregate_state_key(&sample.container)?;
        self.ensure_aggregate_state(&key);
        let pod = self
            .pods
            .get_mut(&sample.container.pod_id)
            .ok_or_else(|| Error::unknown_key(sample.container.pod_id.to_string()))?;
        let container = pod
            .containers
            .get_mut(&sample.container.container_name)
            .ok_or_else(|| Error::unknown_key(sample.container.to_string()))?;
        let aggregate = self
            .aggregate_states
            .get_mut(&key)
            .ok_or_else(|| Error::unknown_key(key.to_string()))?;
        Ok(container.add_sample(&sample.sample, aggregate, &self.config))
    }

    /// Records an OOM kill as an artificial memory sample
    pub fn record_oom(
        &mut self,
        id: &ContainerId,
        timestamp: DateTime<Utc>,
        requested_memory: ResourceAmount,
    ) -> Result<()> {
        let key = self.aggregate_state_key(id)?;
        self.ensure_aggregate_state(&key);
        let pod = self
            .pods
            .get_mut(&id.pod_id)
            .ok_or_else(|| Error::unknown_key(id.pod_id.to_string()))?;
        let container = pod
            .containers
            .get_mut(&id.container_name)
            .ok_or_else(|| Error::unknown_key(id.container_name.clone()))?;
        let aggregate = self
            .aggregate_states
            .get_mut(&key)
            .ok_or_else(|| Error::unknown_key(key.to_string()))?;
        container
            .record_oom(timestamp, requested_memory, aggregate, &self.config)
            .map_err(|e| Error::validation(format!("error recording OOM for {}: {}", id, e)))
    }

    /// Adds the MPA or refreshes it from the API object. A changed selector
    /// recreates the MPA so aggregations are relinked.
    pub fn add_or_update_mpa(
        &mut self,
        object: &MultidimPodAutoscaler,
        selector: Selector,
    ) -> Result<()> {
        let id = object.id();
        let selector_changed = self
            .mpas
            .get(&id)
            .map_or(false, |mpa| mpa.pod_selector.to_string() != selector.to_string());
        if selector_changed {
            self.delete_mpa(&id)?;
        }

        if !self.mpas.contains_key(&id) {
            let created = object
                .creation_timestamp()
                .map(|t| t.0)
                .unwrap_or_else(Utc::now);
            let mut mpa = Mpa::new(id.clone(), selector, created);
            mpa.update_mode = object.update_mode();
            for (key, state) in self.aggregate_states.iter_mut() {
                let labels = self
                    .label_sets
                    .get(&key.labels_key)
                    .cloned()
                    .unwrap_or_default();
                mpa.use_aggregation_if_matching(key, &labels, state);
            }
            mpa.pod_count = self.matching_pods(&mpa).len();
            self.mpas.insert(id.clone(), mpa);
        }

        if let Some(mpa) = self.mpas.get_mut(&id) {
            mpa.update_from_api(object);
            let keys: Vec<AggregateStateKey> = mpa.aggregate_keys().cloned().collect();
            for key in keys {
                if let Some(state) = self.aggregate_states.get_mut(&key) {
                    state.update_mode = Some(mpa.update_mode);
                }
            }
        }
        Ok(())
    }

    pub fn delete_mpa(&mut self, id: &MpaId) -> Result<()> {
        let mpa = self
            .mpas
            .remove(id)
            .ok_or_else(|| Error::unknown_key(id.to_string()))?;
        for key in mpa.aggregate_keys() {
            if let Some(state) = self.aggregate_states.get_mut(key) {
                state.mark_not_autoscaled();
            }
        }
        self.empty_mpas.remove(id);
        Ok(())
    }

    /// Active pods matching the MPA. Scans every pod.
    pub fn matching_pods(&self, mpa: &Mpa) -> Vec<PodId> {
        let mut pods: Vec<PodId> = self
            .pods
            .values()
            .filter(|pod| {
                pod.id.namespace == mpa.id.namespace
                    && self
                        .label_sets
                        .get(&pod.labels_key)
                        .map_or(false, |labels| mpa.pod_selector.matches(labels))
            })
            .map(|pod| pod.id.clone())
            .collect();
        pods.sort();
        pods
    }

    /// Strongest MPA whose selector matches the pod
    pub fn controlling_mpa(&self, pod: &PodState) -> Option<&Mpa> {
        let labels = self.label_sets.get(&pod.labels_key)?;
        self.mpas
            .values()
            .filter(|mpa| mpa.id.namespace == pod.id.namespace && mpa.pod_selector.matches(labels))
            .min_by(|a, b| {
                a.creation_timestamp
                    .cmp(&b.creation_timestamp)
                    .then_with(|| a.id.mpa_name.cmp(&b.id.mpa_name))
            })
    }

    /// Tracks MPAs without recommendation. Errors at most once per
    /// `RECOMMENDATION_MISSING_MAX_DURATION` for each of them.
    pub fn record_recommendation(&mut self, id: &MpaId, now: DateTime<Utc>) -> Result<()> {
        let has_recommendation = self
            .mpas
            .get(id)
            .and_then(|mpa| mpa.recommendation.as_ref())
            .map_or(false, |r| !r.container_recommendations.is_empty());
        if has_recommendation {
            self.empty_mpas.remove(id);
            return Ok(());
        }
        match self.empty_mpas.get(id) {
            None => {
                self.empty_mpas.insert(id.clone(), now);
            }
            Some(last) if *last + RECOMMENDATION_MISSING_MAX_DURATION < now => {
                self.empty_mpas.insert(id.clone(), now);
                return Err(Error::validation(format!(
                    "MPA {} is missing recommendation for more than {} minutes",
                    id,
                    RECOMMENDATION_MISSING_MAX_DURATION.num_minutes()
                )));
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Restores checkpointed history of `container` under the MPA
    pub fn load_checkpoint(
        &mut self,
        id: &MpaId,
        container: &str,
        checkpoint: &MultidimPodAutoscalerCheckpointStatus,
    ) -> Result<()> {
        let mut state = AggregateContainerState::new(&self.layout, Utc::now());
        state.load_from_checkpoint(checkpoint)?;
        let mpa = self
            .mpas
            .get_mut(id)
            .ok_or_else(|| Error::unknown_key(id.to_string()))?;
        mpa.set_initial_aggregate_state(container, state);
        Ok(())
    }

    /// Aggregations of the MPA merged by container name, including
    /// checkpointed history
    pub fn aggregate_state_by_container_name(
        &self,
        id: &MpaId,
    ) -> Result<ContainerNameToAggregateStateMap> {
        let mpa = self
            .mpas
            .get(id)
            .ok_or_else(|| Error::unknown_key(id.to_string()))?;
        let mut merged = ContainerNameToAggregateStateMap::new();
        for key in mpa.aggregate_keys() {
            let Some(state) = self.aggregate_states.get(key) else {
                continue;
            };
            match merged.get_mut(&key.container_name) {
                Some(existing) => existing.merge(state)?,
                None => {
                    let mut fresh = AggregateContainerState::new(&self.layout, state.creation_time);
                    fresh.merge(state)?;
                    fresh.is_under_mpa = state.is_under_mpa;
                    fresh.update_mode = state.update_mode;
                    merged.insert(key.container_name.clone(), fresh);
                }
            }
        }
        mpa.merge_checkpointed_state(&mut merged)?;
        Ok(merged)
    }

    /// Aggregations to persist for the MPA. The peak of the ongoing memory
    /// interval is left out so a restore does not count it twice.
    pub fn checkpoint_states(
        &self,
        id: &MpaId,
        now: DateTime<Utc>,
    ) -> Result<ContainerNameToAggregateStateMap> {
        let mut states = self.aggregate_state_by_container_name(id)?;
        let Some(mpa) = self.mpas.get(id) else {
            return Ok(states);
        };
        for pod in self.pods.values() {
            for (name, container) in &pod.containers {
                let key = self.make_aggregate_state_key(pod, name);
                if !mpa.uses_aggregation(&key) {
                    continue;
                }
                let (Some(state), Some(window_end)) = (states.get_mut(name), container.window_end)
                else {
                    continue;
                };
                if now < window_end {
                    state.subtract_sample(&ContainerUsageSample {
                        measure_start: window_end,
                        usage: container.max_memory_peak(),
                        request: ResourceAmount::ZERO,
                        resource: ResourceName::Memory,
                    });
                }
            }
        }
        Ok(states)
    }

    /// Drops aggregations that are expired, or empty and no longer fed by
    /// any pod. `live_targets` holds MPAs whose target controller exists.
    pub fn garbage_collect_aggregate_states(
        &mut self,
        now: DateTime<Utc>,
        live_targets: &HashSet<MpaId>,
    ) -> usize {
        debug!("Garbage collection of aggregate container states triggered");
        let contributive = self.contributive_keys(live_targets);
        let to_delete: Vec<AggregateStateKey> = self
            .aggregate_states
            .iter()
            .filter(|(key, state)| {
                (!contributive.contains(*key) && state.is_empty()) || state.is_expired(now)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &to_delete {
            debug!(key = %key, "Removing aggregate container state");
            self.aggregate_states.remove(key);
            for mpa in self.mpas.values_mut() {
                mpa.delete_aggregation(key);
            }
        }
        if !to_delete.is_empty() {
            info!(removed = to_delete.len(), "Garbage collected aggregate container states");
        }
        to_delete.len()
    }

    /// Runs the garbage collection at most once per GC interval
    pub fn rate_limited_garbage_collect_aggregate_states(
        &mut self,
        now: DateTime<Utc>,
        live_targets: &HashSet<MpaId>,
    ) -> bool {
        if let Some(last) = self.last_aggregate_gc {
            if now - last < self.gc_interval {
                return false;
            }
        }
        self.garbage_collect_aggregate_states(now, live_targets);
        self.last_aggregate_gc = Some(now);
        true
    }

    fn contributive_keys(&self, live_targets: &HashSet<MpaId>) -> HashSet<AggregateStateKey> {
        let mut keys = HashSet::new();
        for pod in self.pods.values() {
            let controller_exists = self
                .controlling_mpa(pod)
                .map_or(false, |mpa| live_targets.contains(&mpa.id));
            if pod.phase.is_active() || controller_exists {
                for container in pod.containers.keys() {
                    keys.insert(self.make_aggregate_state_key(pod, container));
                }
            }
        }
        keys
    }
}
