//! JSON patches applied to admitted pods

use json_patch::{AddOperation, PatchOperation};
use k8s_openapi::api::core::v1::Pod;
use serde_json::{json, Value};

use super::recommendation::{ContainerResources, PodContainer};
use crate::models::Resources;
use crate::quantity::format_amount;

/// Names of the containers the admission controller looked at
pub const OBSERVED_CONTAINERS_ANNOTATION: &str = "mpaObservedContainers";
/// Human-readable summary of the applied update
pub const UPDATES_ANNOTATION: &str = "mpaUpdates";

fn add(path: String, value: Value) -> PatchOperation {
    PatchOperation::Add(AddOperation { path, value })
}

/// Escapes a map key for use as one JSON pointer token
fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

pub fn add_annotation(key: &str, value: &str) -> PatchOperation {
    add(
        format!("/metadata/annotations/{}", escape_token(key)),
        Value::String(value.to_string()),
    )
}

fn resource_list_patches(
    base: &str,
    field: &str,
    kind: &str,
    present: bool,
    resources: &Resources,
    patches: &mut Vec<PatchOperation>,
    updates: &mut Vec<String>,
) {
    if resources.is_empty() {
        return;
    }
    if !present {
        patches.push(add(format!("{}/{}", base, field), json!({})));
    }
    for (resource, amount) in resources {
        patches.push(add(
            format!("{}/{}/{}", base, field, resource.as_str()),
            Value::String(format_amount(*resource, *amount)),
        ));
        updates.push(format!("{} {}", resource, kind));
    }
}

/// Patches writing `resources` into one container. The second value lists
/// the updated fields, e.g. `cpu request, memory limit`.
fn container_patches(
    target: &PodContainer,
    resources: &ContainerResources,
) -> (Vec<PatchOperation>, Vec<String>) {
    let mut patches = Vec::new();
    let mut updates = Vec::new();
    if resources.is_empty() {
        return (patches, updates);
    }
    let base = format!("{}/{}/resources", target.list.path(), target.index);
    let current = target.container.resources.as_ref();
    if current.is_none() {
        patches.push(add(base.clone(), json!({})));
    }
    resource_list_patches(
        &base,
        "requests",
        "request",
        current.and_then(|r| r.requests.as_ref()).is_some(),
        &resources.requests,
        &mut patches,
        &mut updates,
    );
    resource_list_patches(
        &base,
        "limits",
        "limit",
        current.and_then(|r| r.limits.as_ref()).is_some(),
        &resources.limits,
        &mut patches,
        &mut updates,
    );
    (patches, updates)
}

/// Builds the full patch for a pod controlled by `mpa_name`.
///
/// `containers` and `resources` are parallel. The annotations object is
/// created first when the pod has none; resource patches follow in container
/// order; the update summary and the observed containers come last.
pub fn pod_patches(
    pod: &Pod,
    mpa_name: &str,
    containers: &[PodContainer],
    resources: &[ContainerResources],
) -> Vec<PatchOperation> {
    let mut patches = Vec::new();
    if pod.metadata.annotations.is_none() {
        patches.push(add("/metadata/annotations".to_string(), json!({})));
    }

    let mut summary = Vec::new();
    for (target, resources) in containers.iter().zip(resources) {
        let (container_patches, updates) = container_patches(target, resources);
        patches.extend(container_patches);
        if !updates.is_empty() {
            summary.push(format!("container {}: {}", target.index, updates.join(", ")));
        }
    }
    if !summary.is_empty() {
        patches.push(add_annotation(
            UPDATES_ANNOTATION,
            &format!("Pod resources updated by {}: {}", mpa_name, summary.join("; ")),
        ));
    }

    let observed: Vec<&str> = containers.iter().map(|c| c.container.name.as_str()).collect();
    patches.push(add_annotation(OBSERVED_CONTAINERS_ANNOTATION, &observed.join(", ")));
    patches
}

/// Resource-only patch for the `resize` sub-resource of a running pod
pub fn resize_patches(containers: &[PodContainer], resources: &[ContainerResources]) -> Vec<PatchOperation> {
    containers
        .iter()
        .zip(resources)
        .flat_map(|(target, resources)| container_patches(target, resources).0)
        .collect()
}

/// Container names listed in the observed-containers annotation, or `None`
/// when the pod was never admitted by the controller
pub fn observed_containers(pod: &Pod) -> Option<Vec<String>> {
    let value = pod
        .metadata
        .annotations
        .as_ref()?
        .get(OBSERVED_CONTAINERS_ANNOTATION)?;
    Some(
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    )
}
