use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use k8s_openapi::api::autoscaling::v2::{HorizontalPodAutoscalerBehavior, MetricSpec, MetricStatus};
use kube::ResourceExt;

use super::aggregate::{AggregateContainerState, ContainerNameToAggregateStateMap};
use crate::crd::{
    condition_types, set_condition, ConditionStatus, ContainerResourcePolicy, MpaCondition,
    MultidimPodAutoscaler, MultidimPodAutoscalerStatus, RecommendedPodResources, ScaleTargetRef,
    UpdateMode,
};
use crate::error::Result;
use crate::models::{AggregateStateKey, MpaId};
use crate::target::selector::{Labels, Selector};

/// In-memory view of one MPA object and the aggregations it uses
#[derive(Debug, Clone)]
pub struct Mpa {
    pub id: MpaId,
    pub pod_selector: Selector,
    pub creation_timestamp: DateTime<Utc>,
    pub scale_target_ref: Option<ScaleTargetRef>,
    pub update_mode: UpdateMode,
    pub container_policies: Vec<ContainerResourcePolicy>,
    pub annotations: BTreeMap<String, String>,
    pub conditions: Vec<MpaCondition>,
    /// Last recommendation, kept only while RecommendationProvided is true
    pub recommendation: Option<RecommendedPodResources>,
    /// Number of live pods matching the selector
    pub pod_count: usize,

    pub min_replicas: i32,
    pub max_replicas: i32,
    pub metrics: Vec<MetricSpec>,
    pub behavior: Option<HorizontalPodAutoscalerBehavior>,
    pub current_replicas: Option<i32>,
    pub desired_replicas: Option<i32>,
    pub current_metrics: Vec<MetricStatus>,
    pub last_scale_time: Option<DateTime<Utc>>,

    aggregate_keys: BTreeSet<AggregateStateKey>,
    /// Aggregations restored from checkpoints, keyed by container name
    containers_initial_aggregate_state: ContainerNameToAggregateStateMap,
}

impl Mpa {
    pub fn new(id: MpaId, pod_selector: Selector, creation_timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            pod_selector,
            creation_timestamp,
            scale_target_ref: None,
            update_mode: UpdateMode::default(),
            container_policies: Vec::new(),
            annotations: BTreeMap::new(),
            conditions: Vec::new(),
            recommendation: None,
            pod_count: 0,
            min_replicas: 1,
            max_replicas: i32::MAX,
            metrics: Vec::new(),
            behavior: None,
            current_replicas: None,
            desired_replicas: None,
            current_metrics: Vec::new(),
            last_scale_time: None,
            aggregate_keys: BTreeSet::new(),
            containers_initial_aggregate_state: BTreeMap::new(),
        }
    }

    /// Copies spec and status fields from the API object
    pub fn update_from_api(&mut self, object: &MultidimPodAutoscaler) {
        self.scale_target_ref = object.spec.scale_target_ref.clone();
        self.update_mode = object.update_mode();
        self.container_policies = object.container_policies().to_vec();
        self.annotations = object.annotations().clone();
        self.min_replicas = object.min_replicas();
        self.max_replicas = object.max_replicas();
        self.metrics = object.metrics().to_vec();
        self.behavior = object.behavior().cloned();

        let status = object.status.clone().unwrap_or_default();
        let provided = status
            .condition(condition_types::RECOMMENDATION_PROVIDED)
            .map_or(false, MpaCondition::is_true);
        self.recommendation = if provided {
            status.recommendation.clone()
        } else {
            None
        };
        self.conditions = status.conditions;
        self.current_replicas = status.current_replicas;
        self.desired_replicas = status.desired_replicas;
        self.current_metrics = status.current_metrics;
        self.last_scale_time = status.last_scale_time;
    }

    pub fn uses_aggregation(&self, key: &AggregateStateKey) -> bool {
        self.aggregate_keys.contains(key)
    }

    pub fn matches_aggregation(&self, key: &AggregateStateKey, labels: &Labels) -> bool {
        key.namespace == self.id.namespace && self.pod_selector.matches(labels)
    }

    /// Links `aggregation` to this MPA when its labels match the selector
    pub fn use_aggregation_if_matching(
        &mut self,
        key: &AggregateStateKey,
        labels: &Labels,
        aggregation: &mut AggregateContainerState,
    ) {
        if self.uses_aggregation(key) || !self.matches_aggregation(key, labels) {
            return;
        }
        self.aggregate_keys.insert(key.clone());
        aggregation.is_under_mpa = true;
        aggregation.update_mode = Some(self.update_mode);
    }

    pub fn delete_aggregation(&mut self, key: &AggregateStateKey) {
        self.aggregate_keys.remove(key);
    }

    pub fn aggregate_keys(&self) -> impl Iterator<Item = &AggregateStateKey> {
        self.aggregate_keys.iter()
    }

    pub fn has_matched_pods(&self) -> bool {
        self.pod_count > 0
    }

    pub fn set_initial_aggregate_state(&mut self, container: &str, state: AggregateContainerState) {
        self.containers_initial_aggregate_state
            .insert(container.to_string(), state);
    }

    pub fn initial_aggregate_states(&self) -> &ContainerNameToAggregateStateMap {
        &self.containers_initial_aggregate_state
    }

    /// Merges checkpointed history into per-container aggregations
    pub fn merge_checkpointed_state(
        &self,
        states: &mut ContainerNameToAggregateStateMap,
    ) -> Result<()> {
        for (container, initial) in &self.containers_initial_aggregate_state {
            match states.get_mut(container) {
                Some(state) => state.merge(initial)?,
                None => {
                    states.insert(container.clone(), initial.clone());
                }
            }
        }
        Ok(())
    }

    pub fn has_recommendation(&self) -> bool {
        self.recommendation
            .as_ref()
            .map_or(false, |r| !r.container_recommendations.is_empty())
    }

    pub fn update_recommendation(&mut self, recommendation: Option<RecommendedPodResources>) {
        self.recommendation = recommendation;
    }

    pub fn set_condition(&mut self, type_: &str, status: bool, reason: &str, message: &str) {
        set_condition(
            &mut self.conditions,
            type_,
            ConditionStatus::from(status),
            reason,
            message,
        );
    }

    pub fn remove_condition(&mut self, type_: &str) {
        self.conditions.retain(|c| c.type_ != type_);
    }

    /// Refreshes NoPodsMatched and RecommendationProvided
    pub fn update_conditions(&mut self, pods_matched: bool) {
        let (reason, message) = if pods_matched {
            self.remove_condition(condition_types::NO_PODS_MATCHED);
            ("", "")
        } else {
            let reason = "NoPodsMatched";
            let message = "No pods match this MPA object";
            self.set_condition(condition_types::NO_PODS_MATCHED, true, reason, message);
            (reason, message)
        };
        if self.has_recommendation() {
            self.set_condition(condition_types::RECOMMENDATION_PROVIDED, true, "", "");
        } else {
            self.set_condition(condition_types::RECOMMENDATION_PROVIDED, false, reason, message);
        }
    }

    /// Status carrying the recommendation, conditions and horizontal state
    pub fn as_status(&self) -> MultidimPodAutoscalerStatus {
        MultidimPodAutoscalerStatus {
            recommendation: self
                .has_recommendation()
                .then(|| self.recommendation.clone())
                .flatten(),
            current_replicas: self.current_replicas,
            desired_replicas: self.desired_replicas,
            current_metrics: self.current_metrics.clone(),
            conditions: self.conditions.clone(),
            last_scale_time: self.last_scale_time,
        }
    }
}
