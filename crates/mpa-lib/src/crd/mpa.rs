use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::autoscaling::v2::{HorizontalPodAutoscalerBehavior, MetricSpec, MetricStatus};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::{set_condition, ConditionStatus, MpaCondition};
use crate::models::{MpaId, ResourceName};

/// Container name of the policy that applies to every container without its own entry
pub const DEFAULT_CONTAINER_POLICY: &str = "*";

/// Operator configuration for autoscaling one workload both vertically and horizontally
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "autoscaling.k8s.io",
    version = "v1alpha1",
    kind = "MultidimPodAutoscaler",
    plural = "multidimpodautoscalers",
    shortname = "mpa",
    status = "MultidimPodAutoscalerStatus",
    namespaced,
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.updatePolicy.updateMode"}"#,
    printcolumn = r#"{"name":"Min","type":"integer","jsonPath":".spec.constraints.minReplicas"}"#,
    printcolumn = r#"{"name":"Max","type":"integer","jsonPath":".spec.constraints.maxReplicas"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desiredReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MultidimPodAutoscalerSpec {
    /// Controller managing the pods to autoscale
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_target_ref: Option<ScaleTargetRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_policy: Option<PodUpdatePolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_policy: Option<PodResourcePolicy>,

    /// Horizontal scaling goals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goals: Option<Goals>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<ScalingConstraints>,

    /// Recommender responsible for this object. Empty selects the default recommender.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommenders: Vec<RecommenderSelector>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub kind: String,
    pub name: String,
}

impl ScaleTargetRef {
    /// API group of the target, empty for the core group
    pub fn group(&self) -> &str {
        match self.api_version.as_deref() {
            Some(av) => av.rsplit_once('/').map(|(g, _)| g).unwrap_or(""),
            None => "",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum UpdateMode {
    /// Only compute recommendations
    Off,
    /// Apply recommendations at pod creation only
    Initial,
    /// Apply at creation and by evicting running pods
    Recreate,
    #[default]
    Auto,
    /// Resize running pods in place, evicting only when that is impossible
    InPlaceOrRecreate,
}

impl UpdateMode {
    pub const ALL: [UpdateMode; 5] = [
        UpdateMode::Off,
        UpdateMode::Initial,
        UpdateMode::Recreate,
        UpdateMode::Auto,
        UpdateMode::InPlaceOrRecreate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateMode::Off => "Off",
            UpdateMode::Initial => "Initial",
            UpdateMode::Recreate => "Recreate",
            UpdateMode::Auto => "Auto",
            UpdateMode::InPlaceOrRecreate => "InPlaceOrRecreate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == s)
    }

    /// Modes under which the updater acts on running pods
    pub fn allows_updates(&self) -> bool {
        matches!(
            self,
            UpdateMode::Recreate | UpdateMode::Auto | UpdateMode::InPlaceOrRecreate
        )
    }
}

impl std::fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodUpdatePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_mode: Option<UpdateMode>,

    /// All entries must hold for a pod to be evicted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub eviction_requirements: Vec<EvictionRequirement>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvictionRequirement {
    pub resources: Vec<String>,
    pub change_requirement: ChangeRequirement,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ChangeRequirement {
    TargetHigherThanRequests,
    TargetLowerThanRequests,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodResourcePolicy {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_policies: Vec<ContainerResourcePolicy>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourcePolicy {
    /// Container name, or `*` for the default policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ContainerScalingMode>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub min_allowed: BTreeMap<String, Quantity>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub max_allowed: BTreeMap<String, Quantity>,

    /// Resources the recommendation covers. Defaults to cpu and memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controlled_resources: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controlled_values: Option<ContainerControlledValues>,
}

impl ContainerResourcePolicy {
    pub fn scaling_mode(&self) -> ContainerScalingMode {
        self.mode.unwrap_or_default()
    }

    pub fn controlled_values(&self) -> ContainerControlledValues {
        self.controlled_values.unwrap_or_default()
    }

    pub fn controls(&self, resource: ResourceName) -> bool {
        match &self.controlled_resources {
            Some(list) => list.iter().any(|r| r == resource.as_str()),
            None => true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ContainerScalingMode {
    #[default]
    Auto,
    Off,
}

impl ContainerScalingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Auto" => Some(Self::Auto),
            "Off" => Some(Self::Off),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ContainerControlledValues {
    #[default]
    RequestsAndLimits,
    RequestsOnly,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Goals {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScalingConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behavior: Option<HorizontalPodAutoscalerBehavior>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct RecommenderSelector {
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MultidimPodAutoscalerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<RecommendedPodResources>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub current_metrics: Vec<MetricStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<MpaCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_time: Option<DateTime<Utc>>,
}

impl MultidimPodAutoscalerStatus {
    pub fn condition(&self, type_: &str) -> Option<&MpaCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Sets a condition, keeping its transition time unless the status flips
    pub fn set_condition(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) {
        set_condition(&mut self.conditions, type_, status, reason, message);
    }

    pub fn remove_condition(&mut self, type_: &str) {
        self.conditions.retain(|c| c.type_ != type_);
    }

    pub fn container_recommendation(&self, container: &str) -> Option<&RecommendedContainerResources> {
        self.recommendation
            .as_ref()?
            .container_recommendations
            .iter()
            .find(|r| r.container_name == container)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedPodResources {
    #[serde(default)]
    pub container_recommendations: Vec<RecommendedContainerResources>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedContainerResources {
    pub container_name: String,

    #[serde(default)]
    pub target: BTreeMap<String, Quantity>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lower_bound: BTreeMap<String, Quantity>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub upper_bound: BTreeMap<String, Quantity>,

    /// Target before policy capping
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub uncapped_target: BTreeMap<String, Quantity>,
}

impl MultidimPodAutoscaler {
    pub fn id(&self) -> MpaId {
        MpaId::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn update_mode(&self) -> UpdateMode {
        self.spec
            .update_policy
            .as_ref()
            .and_then(|p| p.update_mode)
            .unwrap_or_default()
    }

    pub fn min_replicas(&self) -> i32 {
        self.spec
            .constraints
            .as_ref()
            .and_then(|c| c.min_replicas)
            .unwrap_or(1)
    }

    pub fn max_replicas(&self) -> i32 {
        self.spec
            .constraints
            .as_ref()
            .and_then(|c| c.max_replicas)
            .unwrap_or(i32::MAX)
    }

    pub fn behavior(&self) -> Option<&HorizontalPodAutoscalerBehavior> {
        self.spec.constraints.as_ref()?.behavior.as_ref()
    }

    pub fn metrics(&self) -> &[MetricSpec] {
        self.spec
            .goals
            .as_ref()
            .map(|g| g.metrics.as_slice())
            .unwrap_or(&[])
    }

    pub fn eviction_requirements(&self) -> &[EvictionRequirement] {
        self.spec
            .update_policy
            .as_ref()
            .map(|p| p.eviction_requirements.as_slice())
            .unwrap_or(&[])
    }

    pub fn container_policies(&self) -> &[ContainerResourcePolicy] {
        self.spec
            .resource_policy
            .as_ref()
            .map(|p| p.container_policies.as_slice())
            .unwrap_or(&[])
    }

    pub fn recommendation(&self) -> Option<&RecommendedPodResources> {
        self.status.as_ref()?.recommendation.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::condition_types;

    #[test]
    fn test_spec_deserializes_camel_case() {
        let json = serde_json::json!({
            "scaleTargetRef": {"apiVersion": "apps/v1", "kind": "Deployment", "name": "web"},
            "updatePolicy": {"updateMode": "Recreate"},
            "resourcePolicy": {"containerPolicies": [{
                "containerName": "*",
                "minAllowed": {"cpu": "50m"},
                "controlledValues": "RequestsOnly"
            }]},
            "constraints": {"minReplicas": 2, "maxReplicas": 6},
            "recommenders": [{"name": "custom"}]
        });
        let spec: MultidimPodAutoscalerSpec = serde_json::from_value(json).unwrap();
        let target = spec.scale_target_ref.as_ref().unwrap();
        assert_eq!(target.kind, "Deployment");
        assert_eq!(target.group(), "apps");
        assert_eq!(
            spec.update_policy.unwrap().update_mode,
            Some(UpdateMode::Recreate)
        );
        let policy = &spec.resource_policy.unwrap().container_policies[0];
        assert_eq!(policy.controlled_values(), ContainerControlledValues::RequestsOnly);
        assert_eq!(policy.scaling_mode(), ContainerScalingMode::Auto);
        assert_eq!(spec.recommenders[0].name, "custom");
    }

    #[test]
    fn test_defaults() {
        let mpa = MultidimPodAutoscaler::new("web", MultidimPodAutoscalerSpec::default());
        assert_eq!(mpa.update_mode(), UpdateMode::Auto);
        assert_eq!(mpa.min_replicas(), 1);
        assert!(mpa.metrics().is_empty());
        assert!(mpa.recommendation().is_none());
    }

    #[test]
    fn test_core_group_target() {
        let target = ScaleTargetRef {
            api_version: Some("v1".to_string()),
            kind: "ReplicationController".to_string(),
            name: "rc".to_string(),
        };
        assert_eq!(target.group(), "");
    }

    #[test]
    fn test_set_condition_keeps_transition_time() {
        let mut status = MultidimPodAutoscalerStatus::default();
        status.set_condition(
            condition_types::RECOMMENDATION_PROVIDED,
            ConditionStatus::True,
            "",
            "",
        );
        let first = status
            .condition(condition_types::RECOMMENDATION_PROVIDED)
            .unwrap()
            .last_transition_time;

        status.set_condition(
            condition_types::RECOMMENDATION_PROVIDED,
            ConditionStatus::True,
            "Again",
            "",
        );
        let cond = status
            .condition(condition_types::RECOMMENDATION_PROVIDED)
            .unwrap();
        assert_eq!(cond.last_transition_time, first);
        assert_eq!(cond.reason.as_deref(), Some("Again"));
        assert_eq!(status.conditions.len(), 1);

        status.remove_condition(condition_types::RECOMMENDATION_PROVIDED);
        assert!(status.conditions.is_empty());
    }

    #[test]
    fn test_update_mode_parse() {
        assert_eq!(UpdateMode::parse("Auto"), Some(UpdateMode::Auto));
        assert_eq!(UpdateMode::parse("auto"), None);
        assert!(UpdateMode::InPlaceOrRecreate.allows_updates());
        assert!(!UpdateMode::Initial.allows_updates());
    }
}
