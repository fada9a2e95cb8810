//! Admission checks for MPA objects

use std::collections::BTreeMap;

use json_patch::{AddOperation, PatchOperation};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde_json::{json, Value};

use crate::crd::{ContainerScalingMode, MultidimPodAutoscaler, UpdateMode};
use crate::error::{Error, Result};
use crate::features::{FeatureGates, IN_PLACE_OR_RECREATE};
use crate::models::ResourceName;
use crate::quantity::parse_strict;

fn string_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

/// Checks enum-valued fields on the raw object so unknown values get a
/// readable message instead of a deserialization error
fn validate_enums(raw: &Value) -> Result<()> {
    if let Some(mode) = string_at(raw, "/spec/updatePolicy/updateMode") {
        if UpdateMode::parse(mode).is_none() {
            return Err(Error::validation(format!("unexpected UpdateMode value {}", mode)));
        }
    }
    let policies = raw
        .pointer("/spec/resourcePolicy/containerPolicies")
        .and_then(Value::as_array);
    for policy in policies.into_iter().flatten() {
        if let Some(mode) = string_at(policy, "/mode") {
            if ContainerScalingMode::parse(mode).is_none() {
                return Err(Error::validation(format!("unexpected Mode value {}", mode)));
            }
        }
        if let Some(values) = string_at(policy, "/controlledValues") {
            if values != "RequestsOnly" && values != "RequestsAndLimits" {
                return Err(Error::validation(format!(
                    "unexpected ControlledValues value {}",
                    values
                )));
            }
        }
    }
    Ok(())
}

fn validate_quantities(
    field: &str,
    list: &BTreeMap<String, Quantity>,
) -> Result<()> {
    for (name, quantity) in list {
        let Some(resource) = ResourceName::parse(name) else {
            continue;
        };
        if parse_strict(resource, &quantity.0).is_err() {
            let message = match resource {
                ResourceName::Cpu => format!(
                    "{}: CPU [{}] must be a whole number of milli CPUs",
                    field, quantity.0
                ),
                ResourceName::Memory => format!(
                    "{}: memory [{}] must be a whole number of bytes",
                    field, quantity.0
                ),
            };
            return Err(Error::validation(message));
        }
    }
    Ok(())
}

/// Validates an MPA object under admission. `raw` is the object as sent by
/// the API server.
pub fn validate_mpa(raw: &Value, is_create: bool, features: FeatureGates) -> Result<MultidimPodAutoscaler> {
    validate_enums(raw)?;
    let mpa: MultidimPodAutoscaler = serde_json::from_value(raw.clone())
        .map_err(|e| Error::validation(format!("cannot parse MPA object: {}", e)))?;
    let spec = &mpa.spec;

    if let Some(policy) = &spec.update_policy {
        match policy.update_mode {
            None => return Err(Error::validation("updateMode is required if UpdatePolicy is used")),
            Some(UpdateMode::InPlaceOrRecreate) if !features.in_place_or_recreate => {
                return Err(Error::validation(format!(
                    "in order to use UpdateMode {}, you must enable feature gate {} in the admission-controller args",
                    UpdateMode::InPlaceOrRecreate,
                    IN_PLACE_OR_RECREATE
                )));
            }
            Some(_) => {}
        }
    }

    let max_replicas = spec.constraints.as_ref().and_then(|c| c.max_replicas);
    if let Some(min) = spec.constraints.as_ref().and_then(|c| c.min_replicas) {
        if min <= 0 {
            return Err(Error::validation(format!(
                "minReplicas has to be positive, got {}",
                min
            )));
        }
    }
    if let Some(max) = max_replicas {
        let min = mpa.min_replicas();
        if min > max {
            return Err(Error::validation(format!(
                "minReplicas ({}) must not exceed maxReplicas ({})",
                min, max
            )));
        }
    }

    for policy in mpa.container_policies() {
        if policy.container_name.as_deref().map_or(true, str::is_empty) {
            return Err(Error::validation("containerPolicies.ContainerName is required"));
        }
        validate_quantities("minAllowed", &policy.min_allowed)?;
        validate_quantities("maxAllowed", &policy.max_allowed)?;
        for (name, max) in &policy.max_allowed {
            let (Some(resource), Some(min)) = (ResourceName::parse(name), policy.min_allowed.get(name))
            else {
                continue;
            };
            let (Ok(min), Ok(max)) = (parse_strict(resource, &min.0), parse_strict(resource, &max.0))
            else {
                continue;
            };
            if max < min {
                return Err(Error::validation(format!(
                    "max resource for {} is lower than min",
                    name
                )));
            }
        }
        if policy.scaling_mode() == ContainerScalingMode::Off && policy.controlled_values.is_some() {
            return Err(Error::validation(
                "controlledValues shouldn't be specified if container scaling mode is off",
            ));
        }
    }

    if is_create && spec.scale_target_ref.is_none() {
        return Err(Error::validation("scaleTargetRef is required"));
    }

    if spec.recommenders.len() > 1 {
        return Err(Error::validation(
            "the current version of MPA object shouldn't specify more than one recommenders",
        ));
    }

    if max_replicas.is_none() {
        return Err(Error::validation("constraints.maxReplicas is required"));
    }

    Ok(mpa)
}

/// Patches defaulting an admitted MPA: `updateMode: Auto` when no update
/// policy is given
pub fn default_patches(mpa: &MultidimPodAutoscaler) -> Vec<PatchOperation> {
    if mpa.spec.update_policy.is_some() {
        return Vec::new();
    }
    vec![PatchOperation::Add(AddOperation {
        path: "/spec/updatePolicy".to_string(),
        value: json!({ "updateMode": UpdateMode::Auto.as_str() }),
    })]
}
