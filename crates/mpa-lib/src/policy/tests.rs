use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Container, LimitRange, LimitRangeItem, LimitRangeSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::*;
use crate::client::fake::FakeCluster;
use crate::crd::ContainerResourcePolicy;
use crate::models::ResourceAmount;
use crate::testutil::NAMESPACE;

const MI: i64 = 1 << 20;

fn list(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    let mut out = BTreeMap::new();
    if !cpu.is_empty() {
        out.insert("cpu".to_string(), Quantity(cpu.to_string()));
    }
    if !memory.is_empty() {
        out.insert("memory".to_string(), Quantity(memory.to_string()));
    }
    out
}

fn container(name: &str, requests: (&str, &str), limits: (&str, &str)) -> Container {
    let limits = list(limits.0, limits.1);
    Container {
        name: name.to_string(),
        resources: Some(ResourceRequirements {
            requests: Some(list(requests.0, requests.1)),
            limits: (!limits.is_empty()).then_some(limits),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn recommendation(container: &str, cpu: &str, memory: &str) -> RecommendedContainerResources {
    RecommendedContainerResources {
        container_name: container.to_string(),
        target: list(cpu, memory),
        lower_bound: list(cpu, memory),
        upper_bound: list(cpu, memory),
        uncapped_target: list(cpu, memory),
    }
}

fn pod_recommendation(containers: Vec<RecommendedContainerResources>) -> RecommendedPodResources {
    RecommendedPodResources {
        container_recommendations: containers,
    }
}

fn item(type_: &str, max: (&str, &str), min: (&str, &str)) -> LimitRangeItem {
    let max = list(max.0, max.1);
    let min = list(min.0, min.1);
    LimitRangeItem {
        type_: type_.to_string(),
        max: (!max.is_empty()).then_some(max),
        min: (!min.is_empty()).then_some(min),
        ..Default::default()
    }
}

fn limit_range(name: &str, items: Vec<LimitRangeItem>) -> LimitRange {
    LimitRange {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(LimitRangeSpec { limits: items }),
    }
}

fn policy(name: &str) -> ContainerResourcePolicy {
    ContainerResourcePolicy {
        container_name: Some(name.to_string()),
        ..Default::default()
    }
}

#[test]
fn test_exact_container_policy_beats_default() {
    let mut default = policy("*");
    default.max_allowed = list("1", "");
    let mut exact = policy("app");
    exact.max_allowed = list("2", "");
    let policies = vec![default, exact];

    let found = container_policy("app", &policies).unwrap();
    assert_eq!(found.container_name.as_deref(), Some("app"));
    let fallback = container_policy("sidecar", &policies).unwrap();
    assert_eq!(fallback.container_name.as_deref(), Some("*"));
    assert!(container_policy("app", &[]).is_none());
}

#[test]
fn test_policy_caps_target_and_keeps_uncapped() {
    let mut app = policy("app");
    app.min_allowed = list("300m", "");
    app.max_allowed = list("", "100Mi");

    let capped = apply_mpa_policy(
        &pod_recommendation(vec![recommendation("app", "250m", "200Mi")]),
        &[app],
    );
    let rec = &capped.container_recommendations[0];
    assert_eq!(rec.target, list("300m", "100Mi"));
    assert_eq!(rec.lower_bound, list("300m", "100Mi"));
    assert_eq!(rec.uncapped_target, list("250m", "200Mi"));
}

#[test]
fn test_off_container_is_dropped() {
    let mut off = policy("sidecar");
    off.mode = Some(ContainerScalingMode::Off);

    let capped = apply_mpa_policy(
        &pod_recommendation(vec![
            recommendation("app", "250m", "200Mi"),
            recommendation("sidecar", "10m", "20Mi"),
        ]),
        &[off],
    );
    let names: Vec<&str> = capped
        .container_recommendations
        .iter()
        .map(|r| r.container_name.as_str())
        .collect();
    assert_eq!(names, vec!["app"]);
}

#[test]
fn test_uncontrolled_resources_are_dropped() {
    let mut cpu_only = policy("*");
    cpu_only.controlled_resources = Some(vec!["cpu".to_string()]);

    let capped = apply_mpa_policy(
        &pod_recommendation(vec![recommendation("app", "250m", "200Mi")]),
        &[cpu_only],
    );
    let rec = &capped.container_recommendations[0];
    assert_eq!(rec.target, list("250m", ""));
    assert_eq!(rec.uncapped_target, list("250m", ""));
}

#[test]
fn test_is_controlled_defaults_to_every_resource() {
    let mut cpu_only = policy("app");
    cpu_only.controlled_resources = Some(vec!["cpu".to_string()]);
    let policies = vec![cpu_only];
    assert!(is_controlled("app", ResourceName::Cpu, &policies));
    assert!(!is_controlled("app", ResourceName::Memory, &policies));
    assert!(is_controlled("other", ResourceName::Memory, &policies));
}

#[test]
fn test_proportional_limit_keeps_ratio() {
    let (cpu, note) = proportional_limit(
        Some(ResourceAmount(150)),
        Some(ResourceAmount(100)),
        ResourceAmount(250),
        None,
    );
    assert_eq!(cpu, Some(ResourceAmount(375)));
    assert!(note.is_none());

    let (memory, _) = proportional_limit(
        Some(ResourceAmount(200 * MI)),
        Some(ResourceAmount(100 * MI)),
        ResourceAmount(200 * MI),
        None,
    );
    assert_eq!(memory, Some(ResourceAmount(400 * MI)));
}

#[test]
fn test_proportional_limit_without_limit_or_request() {
    let (none, _) = proportional_limit(None, Some(ResourceAmount(100)), ResourceAmount(250), None);
    assert_eq!(none, None);

    // A limit-range default stands in for the missing limit.
    let (defaulted, _) = proportional_limit(
        None,
        Some(ResourceAmount(100)),
        ResourceAmount(250),
        Some(ResourceAmount(200)),
    );
    assert_eq!(defaulted, Some(ResourceAmount(500)));

    let (limit_only, _) = proportional_limit(Some(ResourceAmount(150)), None, ResourceAmount(250), None);
    assert_eq!(limit_only, Some(ResourceAmount(250)));
}

#[test]
fn test_proportional_limit_overflow_is_annotated() {
    let (limit, note) = proportional_limit(
        Some(ResourceAmount(i64::MAX / 2)),
        Some(ResourceAmount(1)),
        ResourceAmount(4),
        None,
    );
    assert_eq!(limit, Some(ResourceAmount::MAX));
    assert!(note.is_some());
}

#[test]
fn test_boundary_request() {
    // 300m max limit at a 1.5 ratio allows a 200m request.
    assert_eq!(
        boundary_request(
            Some(ResourceAmount(100)),
            Some(ResourceAmount(150)),
            Some(ResourceAmount(300)),
            None
        ),
        Some(ResourceAmount(200))
    );
    assert_eq!(
        boundary_request(Some(ResourceAmount(100)), None, Some(ResourceAmount(300)), None),
        None
    );
    assert_eq!(
        boundary_request(None, Some(ResourceAmount(150)), Some(ResourceAmount(300)), None),
        Some(ResourceAmount(300))
    );
    assert_eq!(
        boundary_request(Some(ResourceAmount(100)), Some(ResourceAmount(150)), None, None),
        None
    );
}

#[test]
fn test_container_limit_range_caps_request_by_ratio() {
    let pod_containers = vec![container("app", ("100m", "100Mi"), ("150m", "200Mi"))];
    let limits = LimitRangeItems {
        container: Some(item("Container", ("300m", "1Gi"), ("", ""))),
        pod: None,
    };

    let (capped, annotations) = cap_recommendation(
        &pod_recommendation(vec![recommendation("app", "250m", "200Mi")]),
        &[],
        &pod_containers,
        &limits,
    );
    let rec = &capped.container_recommendations[0];
    assert_eq!(rec.target, list("200m", "200Mi"));
    assert_eq!(rec.uncapped_target, list("250m", "200Mi"));
    assert_eq!(
        annotations["app"],
        vec!["cpu capped to fit Max in container LimitRange".to_string()]
    );
}

#[test]
fn test_container_limit_range_min_raises_request() {
    let pod_containers = vec![container("app", ("100m", ""), ("200m", ""))];
    let limits = LimitRangeItems {
        container: Some(item("Container", ("", ""), ("1", ""))),
        pod: None,
    };

    let (capped, _) = cap_recommendation(
        &pod_recommendation(vec![recommendation("app", "100m", "")]),
        &[],
        &pod_containers,
        &limits,
    );
    // 1 core minimum limit at a 2x ratio needs a 500m request.
    assert_eq!(capped.container_recommendations[0].target, list("500m", ""));
}

#[test]
fn test_pod_limit_range_max_scales_containers_down() {
    let pod_containers = vec![
        container("a", ("100m", ""), ("200m", "")),
        container("b", ("100m", ""), ("200m", "")),
    ];
    let limits = LimitRangeItems {
        container: None,
        pod: Some(item("Pod", ("1", ""), ("", ""))),
    };

    let (capped, _) = cap_recommendation(
        &pod_recommendation(vec![
            recommendation("a", "400m", ""),
            recommendation("b", "400m", ""),
        ]),
        &[],
        &pod_containers,
        &limits,
    );
    // Limits would sum to 1600m; both requests shrink by 1000/1600.
    for rec in &capped.container_recommendations {
        assert_eq!(rec.target, list("250m", ""));
    }
}

#[test]
fn test_pod_limit_range_min_scales_containers_up() {
    let pod_containers = vec![
        container("a", ("100m", ""), ("200m", "")),
        container("b", ("100m", ""), ("200m", "")),
    ];
    let limits = LimitRangeItems {
        container: None,
        pod: Some(item("Pod", ("", ""), ("1", ""))),
    };

    let (capped, _) = cap_recommendation(
        &pod_recommendation(vec![
            recommendation("a", "100m", ""),
            recommendation("b", "100m", ""),
        ]),
        &[],
        &pod_containers,
        &limits,
    );
    for rec in &capped.container_recommendations {
        assert_eq!(rec.target, list("500m", ""));
    }
}

#[test]
fn test_recommendation_for_absent_container_is_dropped() {
    let pod_containers = vec![container("app", ("100m", "100Mi"), ("", ""))];
    let (capped, _) = cap_recommendation(
        &pod_recommendation(vec![
            recommendation("app", "250m", "200Mi"),
            recommendation("gone", "250m", "200Mi"),
        ]),
        &[],
        &pod_containers,
        &LimitRangeItems::default(),
    );
    assert_eq!(capped.container_recommendations.len(), 1);
    assert_eq!(capped.container_recommendations[0].container_name, "app");
}

#[test]
fn test_merge_keeps_strictest_bounds() {
    let ranges = vec![
        limit_range("wide", vec![item("Container", ("1", "2Gi"), ("50m", ""))]),
        limit_range(
            "narrow",
            vec![
                item("Container", ("500m", ""), ("100m", "64Mi")),
                item("Pod", ("2", ""), ("", "")),
            ],
        ),
    ];

    let merged = LimitRangeItems::from_ranges(&ranges);
    let container = merged.container.unwrap();
    assert_eq!(container.max, Some(list("500m", "2Gi")));
    assert_eq!(container.min, Some(list("100m", "64Mi")));
    assert_eq!(merged.pod.unwrap().max, Some(list("2", "")));
    assert!(merge_limit_range_items(&ranges, "PersistentVolumeClaim").is_none());
}

#[tokio::test]
async fn test_capping_processor_reads_namespace_limit_ranges() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.limit_ranges.lock().unwrap().push(limit_range(
        "limits",
        vec![item("Container", ("300m", "1Gi"), ("", ""))],
    ));
    let processor = CappingProcessor::new(LimitRangeCalculator::new(cluster.clone()));

    let pod_containers = vec![container("app", ("100m", "100Mi"), ("150m", "200Mi"))];
    let (capped, _, items) = processor
        .apply(
            &pod_recommendation(vec![recommendation("app", "250m", "200Mi")]),
            &[],
            NAMESPACE,
            &pod_containers,
        )
        .await
        .unwrap();
    assert!(items.container.is_some());
    assert_eq!(capped.container_recommendations[0].target, list("200m", "200Mi"));

    let (_, _, other) = processor
        .apply(&pod_recommendation(Vec::new()), &[], "other", &pod_containers)
        .await
        .unwrap();
    assert_eq!(other, LimitRangeItems::default());
}
