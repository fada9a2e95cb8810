use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::histogram::HistogramCheckpoint;

/// Version tag of the aggregated state format
pub const CHECKPOINT_VERSION: &str = "v3";

/// Persisted aggregated usage of one container under one MPA
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "autoscaling.k8s.io",
    version = "v1alpha1",
    kind = "MultidimPodAutoscalerCheckpoint",
    plural = "multidimpodautoscalercheckpoints",
    shortname = "mpacheckpoint",
    status = "MultidimPodAutoscalerCheckpointStatus",
    namespaced,
    printcolumn = r#"{"name":"MPA","type":"string","jsonPath":".spec.mpaObjectName"}"#,
    printcolumn = r#"{"name":"Container","type":"string","jsonPath":".spec.containerName"}"#,
    printcolumn = r#"{"name":"Samples","type":"integer","jsonPath":".status.totalSamplesCount"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MultidimPodAutoscalerCheckpointSpec {
    pub mpa_object_name: String,
    pub container_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MultidimPodAutoscalerCheckpointStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub cpu_histogram: HistogramCheckpoint,

    #[serde(default)]
    pub memory_histogram: HistogramCheckpoint,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_sample_start: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sample_start: Option<DateTime<Utc>>,

    #[serde(default)]
    pub total_samples_count: i64,
}

impl MultidimPodAutoscalerCheckpoint {
    /// Object name used for the checkpoint of `container` under `mpa_name`
    pub fn object_name(mpa_name: &str, container: &str) -> String {
        format!("{}-{}", mpa_name, container)
    }
}
