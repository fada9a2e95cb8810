//! `mpactl get` commands

use anyhow::Result;
use chrono::Utc;
use kube::ResourceExt;
use mpa_lib::crd::{condition_types, MultidimPodAutoscaler, MultidimPodAutoscalerCheckpoint};
use tabled::Tabled;

use crate::client::MpaCtlClient;
use crate::output::{
    color_condition, color_mode, format_age, format_optional, format_resources, print_table,
    OutputFormat,
};

/// Row for the MPA table
#[derive(Tabled)]
struct MpaRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Mode")]
    mode: String,
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Min")]
    min: String,
    #[tabled(rename = "Max")]
    max: String,
    #[tabled(rename = "Desired")]
    desired: String,
    #[tabled(rename = "Target Resources")]
    resources: String,
    #[tabled(rename = "Provided")]
    provided: String,
    #[tabled(rename = "Age")]
    age: String,
}

/// Row for the checkpoint table
#[derive(Tabled)]
struct CheckpointRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "MPA")]
    mpa: String,
    #[tabled(rename = "Container")]
    container: String,
    #[tabled(rename = "Samples")]
    samples: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

fn mpa_row(mpa: &MultidimPodAutoscaler, now: chrono::DateTime<Utc>) -> MpaRow {
    let target = mpa
        .spec
        .scale_target_ref
        .as_ref()
        .map(|t| format!("{}/{}", t.kind, t.name))
        .unwrap_or_else(|| "-".to_string());
    let constraints = mpa.spec.constraints.as_ref();
    let resources = mpa
        .recommendation()
        .map(|r| {
            r.container_recommendations
                .iter()
                .map(|c| format!("{}: {}", c.container_name, format_resources(&c.target)))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "-".to_string());
    let provided = mpa
        .status
        .as_ref()
        .and_then(|s| s.condition(condition_types::RECOMMENDATION_PROVIDED))
        .map(|c| if c.is_true() { "True" } else { "False" })
        .unwrap_or("Unknown");

    MpaRow {
        namespace: mpa.namespace().unwrap_or_default(),
        name: mpa.name_any(),
        mode: color_mode(mpa.update_mode().as_str()),
        target,
        min: format_optional(constraints.and_then(|c| c.min_replicas)),
        max: format_optional(constraints.and_then(|c| c.max_replicas)),
        desired: format_optional(mpa.status.as_ref().and_then(|s| s.desired_replicas)),
        resources,
        provided: color_condition(provided),
        age: format_age(mpa.metadata.creation_timestamp.as_ref().map(|t| t.0), now),
    }
}

fn checkpoint_row(checkpoint: &MultidimPodAutoscalerCheckpoint, now: chrono::DateTime<Utc>) -> CheckpointRow {
    let status = checkpoint.status.as_ref();
    CheckpointRow {
        namespace: checkpoint.namespace().unwrap_or_default(),
        name: checkpoint.name_any(),
        mpa: checkpoint.spec.mpa_object_name.clone(),
        container: checkpoint.spec.container_name.clone(),
        samples: format_optional(status.map(|s| s.total_samples_count)),
        version: status
            .map(|s| s.version.clone())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "-".to_string()),
        updated: format_age(status.and_then(|s| s.last_update_time), now),
    }
}

/// List MPAs with their mode, bounds and per-container targets
pub async fn get_mpas(client: &MpaCtlClient, namespace: Option<String>, format: OutputFormat) -> Result<()> {
    let mut mpas = client.list_mpas(namespace.as_deref()).await?;
    mpas.sort_by_key(|m| (m.namespace(), m.name_any()));

    let now = Utc::now();
    let rows: Vec<MpaRow> = mpas.iter().map(|m| mpa_row(m, now)).collect();
    print_table(rows, &mpas, format, "MPAs");
    Ok(())
}

/// List checkpoints with their sample counts and age
pub async fn get_checkpoints(
    client: &MpaCtlClient,
    namespace: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let mut checkpoints = client.list_checkpoints(namespace.as_deref()).await?;
    checkpoints.sort_by_key(|c| (c.namespace(), c.name_any()));

    let now = Utc::now();
    let rows: Vec<CheckpointRow> = checkpoints.iter().map(|c| checkpoint_row(c, now)).collect();
    print_table(rows, &checkpoints, format, "checkpoints");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use mpa_lib::crd::{
        MultidimPodAutoscalerCheckpointSpec, MultidimPodAutoscalerCheckpointStatus,
        MultidimPodAutoscalerSpec, MultidimPodAutoscalerStatus, RecommendedContainerResources,
        RecommendedPodResources, ScaleTargetRef, ScalingConstraints,
    };
    use std::collections::BTreeMap;

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_mpa_row() {
        let mut mpa = MultidimPodAutoscaler::new(
            "web",
            MultidimPodAutoscalerSpec {
                scale_target_ref: Some(ScaleTargetRef {
                    api_version: Some("apps/v1".to_string()),
                    kind: "Deployment".to_string(),
                    name: "web".to_string(),
                }),
                constraints: Some(ScalingConstraints {
                    min_replicas: Some(2),
                    max_replicas: Some(8),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        mpa.metadata.namespace = Some("shop".to_string());
        mpa.metadata.creation_timestamp = Some(Time(now() - Duration::days(2)));
        mpa.status = Some(MultidimPodAutoscalerStatus {
            desired_replicas: Some(3),
            recommendation: Some(RecommendedPodResources {
                container_recommendations: vec![RecommendedContainerResources {
                    container_name: "app".to_string(),
                    target: BTreeMap::from([("cpu".to_string(), Quantity("250m".to_string()))]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        });

        let row = mpa_row(&mpa, now());
        assert_eq!(row.namespace, "shop");
        assert_eq!(row.target, "Deployment/web");
        assert_eq!(row.min, "2");
        assert_eq!(row.max, "8");
        assert_eq!(row.desired, "3");
        assert_eq!(row.resources, "app: cpu=250m");
        assert_eq!(row.age, "2d");
    }

    #[test]
    fn test_mpa_row_without_status() {
        let mpa = MultidimPodAutoscaler::new("bare", MultidimPodAutoscalerSpec::default());
        let row = mpa_row(&mpa, now());
        assert_eq!(row.target, "-");
        assert_eq!(row.desired, "-");
        assert_eq!(row.resources, "-");
        assert_eq!(row.age, "-");
    }

    #[test]
    fn test_checkpoint_row() {
        let mut checkpoint = MultidimPodAutoscalerCheckpoint::new(
            "web-app",
            MultidimPodAutoscalerCheckpointSpec {
                mpa_object_name: "web".to_string(),
                container_name: "app".to_string(),
            },
        );
        checkpoint.metadata.namespace = Some("shop".to_string());
        checkpoint.status = Some(MultidimPodAutoscalerCheckpointStatus {
            last_update_time: Some(now() - Duration::minutes(5)),
            version: "v3".to_string(),
            total_samples_count: 42,
            ..Default::default()
        });

        let row = checkpoint_row(&checkpoint, now());
        assert_eq!(row.mpa, "web");
        assert_eq!(row.container, "app");
        assert_eq!(row.samples, "42");
        assert_eq!(row.version, "v3");
        assert_eq!(row.updated, "5m");

        checkpoint.status.as_mut().unwrap().last_update_time = Some(now() - Duration::seconds(90));
        assert_eq!(checkpoint_row(&checkpoint, now()).updated, "90s");
    }
}
