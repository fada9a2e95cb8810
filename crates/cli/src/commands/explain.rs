//! `mpactl explain pod`: show the patch the admission webhook would apply

use anyhow::{bail, Context, Result};
use json_patch::PatchOperation;
use mpa_lib::FeatureGates;
use serde_json::Value;
use tabled::Tabled;

use crate::client::MpaCtlClient;
use crate::output::{print_info, print_table, print_warning, OutputFormat};

#[derive(Tabled)]
struct OperationRow {
    #[tabled(rename = "Op")]
    op: String,
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Value")]
    value: String,
}

/// Split `NAMESPACE/NAME`; a bare name lives in `default`
fn parse_pod_ref(pod: &str) -> Result<(&str, &str)> {
    let (namespace, name) = pod.split_once('/').unwrap_or(("default", pod));
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        bail!("Invalid pod reference {:?}, expected NAMESPACE/NAME", pod);
    }
    Ok((namespace, name))
}

fn operation_row(operation: &PatchOperation) -> Result<OperationRow> {
    let value = serde_json::to_value(operation).context("Failed to encode patch operation")?;
    let field = |key: &str| match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "-".to_string(),
    };
    Ok(OperationRow {
        op: field("op"),
        path: field("path"),
        value: field("value"),
    })
}

pub async fn explain_pod(
    client: &MpaCtlClient,
    pod: &str,
    features: FeatureGates,
    format: OutputFormat,
) -> Result<()> {
    let (namespace, name) = parse_pod_ref(pod)?;
    let pod = client.get_pod(namespace, name).await?;
    let handler = client.pod_handler(features).await?;
    let patch = handler
        .patch(pod, namespace)
        .await
        .context("Failed to compute pod patch")?;

    let Some(mpa) = patch.mpa else {
        print_warning(&format!("No MPA controls pod {}/{}", namespace, name));
        return Ok(());
    };
    if format == OutputFormat::Table {
        print_info(&format!("Pod {}/{} is controlled by MPA {}", namespace, name, mpa));
    }

    let rows = patch
        .operations
        .iter()
        .map(operation_row)
        .collect::<Result<Vec<_>>>()?;
    print_table(rows, &patch.operations, format, "patch operations");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pod_ref() {
        assert_eq!(parse_pod_ref("shop/web-0").unwrap(), ("shop", "web-0"));
        assert_eq!(parse_pod_ref("web-0").unwrap(), ("default", "web-0"));
        assert!(parse_pod_ref("shop/").is_err());
        assert!(parse_pod_ref("/web-0").is_err());
        assert!(parse_pod_ref("a/b/c").is_err());
    }

    #[test]
    fn test_operation_row() {
        let operation: PatchOperation = serde_json::from_value(serde_json::json!({
            "op": "add",
            "path": "/spec/containers/0/resources/requests/cpu",
            "value": "250m"
        }))
        .unwrap();
        let row = operation_row(&operation).unwrap();
        assert_eq!(row.op, "add");
        assert_eq!(row.path, "/spec/containers/0/resources/requests/cpu");
        assert_eq!(row.value, "250m");
    }

    #[test]
    fn test_operation_row_object_value() {
        let operation: PatchOperation = serde_json::from_value(serde_json::json!({
            "op": "add",
            "path": "/metadata/annotations",
            "value": {}
        }))
        .unwrap();
        let row = operation_row(&operation).unwrap();
        assert_eq!(row.value, "{}");
    }
}
