//! `mpactl crd`: print the CustomResourceDefinitions to install

use anyhow::Result;
use kube::CustomResourceExt;
use mpa_lib::crd::{MultidimPodAutoscaler, MultidimPodAutoscalerCheckpoint};
use serde_json::{json, Value};

/// Both definitions wrapped in a `v1/List`, ready for `kubectl apply -f -`
pub fn crd_list() -> Result<Value> {
    Ok(json!({
        "apiVersion": "v1",
        "kind": "List",
        "items": [
            serde_json::to_value(MultidimPodAutoscaler::crd())?,
            serde_json::to_value(MultidimPodAutoscalerCheckpoint::crd())?,
        ],
    }))
}

pub fn print_crds() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&crd_list()?)?);
    Ok(())
}
