//! Object builders shared by unit tests

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodStatus, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference, Time};

use crate::client::fake::FakeCluster;
use crate::client::ControllerInfo;
use crate::crd::{
    MultidimPodAutoscaler, MultidimPodAutoscalerSpec, RecommendedContainerResources,
    RecommendedPodResources, ScaleTargetRef,
};

pub const NAMESPACE: &str = "default";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), app.to_string())])
}

pub fn owner(kind: &str, name: &str, api_version: &str) -> OwnerReference {
    OwnerReference {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: format!("{}-uid", name),
        controller: Some(true),
        ..Default::default()
    }
}

pub fn replica_set_owner(name: &str) -> OwnerReference {
    owner("ReplicaSet", name, "apps/v1")
}

/// Container with requests and limits given in millicores and bytes
pub fn container(name: &str, cpu_millis: i64, memory_bytes: i64) -> Container {
    let quantities = BTreeMap::from([
        ("cpu".to_string(), Quantity(format!("{}m", cpu_millis))),
        ("memory".to_string(), Quantity(memory_bytes.to_string())),
    ]);
    Container {
        name: name.to_string(),
        resources: Some(ResourceRequirements {
            requests: Some(quantities),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn pod(name: &str, app: &str, owner: Option<OwnerReference>, containers: Vec<Container>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(labels(app)),
            owner_references: owner.map(|o| vec![o]),
            creation_timestamp: Some(Time(t0())),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers,
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            start_time: Some(Time(t0())),
            ..Default::default()
        }),
    }
}

pub fn mpa(name: &str, kind: &str, target: &str, created: DateTime<Utc>) -> MultidimPodAutoscaler {
    let mut mpa = MultidimPodAutoscaler::new(
        name,
        MultidimPodAutoscalerSpec {
            scale_target_ref: Some(ScaleTargetRef {
                api_version: Some("apps/v1".to_string()),
                kind: kind.to_string(),
                name: target.to_string(),
            }),
            ..Default::default()
        },
    );
    mpa.metadata.namespace = Some(NAMESPACE.to_string());
    mpa.metadata.creation_timestamp = Some(Time(created));
    mpa.metadata.uid = Some(format!("{}-uid", name));
    mpa
}

pub fn app_selector(app: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(labels(app)),
        ..Default::default()
    }
}

/// Registers `deployment` and a ReplicaSet `<deployment>-rs` it owns, both
/// selecting `app=<app>`
pub fn add_deployment(cluster: &FakeCluster, deployment: &str, app: &str, replicas: i32) {
    cluster.add_controller(
        NAMESPACE,
        "Deployment",
        deployment,
        ControllerInfo {
            owner_references: Vec::new(),
            selector: Some(app_selector(app)),
            configured_replicas: Some(replicas),
        },
    );
    cluster.add_controller(
        NAMESPACE,
        "ReplicaSet",
        &format!("{}-rs", deployment),
        ControllerInfo {
            owner_references: vec![owner("Deployment", deployment, "apps/v1")],
            selector: Some(app_selector(app)),
            configured_replicas: Some(replicas),
        },
    );
}

/// Resource list with the non-empty of `cpu` and `memory`
pub fn resource_list(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    let mut list = BTreeMap::new();
    if !cpu.is_empty() {
        list.insert("cpu".to_string(), Quantity(cpu.to_string()));
    }
    if !memory.is_empty() {
        list.insert("memory".to_string(), Quantity(memory.to_string()));
    }
    list
}

/// Recommendation whose target, bounds and uncapped target are all equal
pub fn flat_recommendation(container: &str, cpu: &str, memory: &str) -> RecommendedContainerResources {
    RecommendedContainerResources {
        container_name: container.to_string(),
        target: resource_list(cpu, memory),
        lower_bound: resource_list(cpu, memory),
        upper_bound: resource_list(cpu, memory),
        uncapped_target: resource_list(cpu, memory),
    }
}

pub fn set_recommendation(mpa: &mut MultidimPodAutoscaler, containers: Vec<RecommendedContainerResources>) {
    mpa.status.get_or_insert_with(Default::default).recommendation = Some(RecommendedPodResources {
        container_recommendations: containers,
    });
}

/// `container` with limits added
pub fn with_limits(mut container: Container, cpu: &str, memory: &str) -> Container {
    container
        .resources
        .get_or_insert_with(Default::default)
        .limits = Some(resource_list(cpu, memory));
    container
}
