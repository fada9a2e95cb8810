use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{ContainerResizePolicy, Pod};

use super::*;
use crate::client::fake::FakeCluster;
use crate::crd::{MultidimPodAutoscaler, PodUpdatePolicy, ScalingConstraints, UpdateMode};
use crate::features::FeatureGates;
use crate::lease::LeaseRefresher;
use crate::target::ControllerFetcher;
use crate::testutil::*;

const LEASE_NAMESPACE: &str = "kube-system";

fn now() -> DateTime<Utc> {
    t0() + Duration::hours(1)
}

fn config() -> UpdaterConfig {
    UpdaterConfig {
        use_admission_controller_status: false,
        lease_namespace: LEASE_NAMESPACE.to_string(),
        ..Default::default()
    }
}

fn updater(cluster: &Arc<FakeCluster>, config: UpdaterConfig) -> Updater {
    let fetcher = ControllerFetcher::new(cluster.clone(), cluster.clone());
    Updater::new(
        config,
        cluster.clone(),
        cluster.clone(),
        cluster.clone(),
        cluster.clone(),
        cluster.clone(),
        fetcher,
    )
}

fn web_mpa(mode: UpdateMode) -> MultidimPodAutoscaler {
    let mut mpa = mpa("web-mpa", "Deployment", "web", t0());
    mpa.spec.update_policy = Some(PodUpdatePolicy {
        update_mode: Some(mode),
        ..Default::default()
    });
    set_recommendation(&mut mpa, vec![flat_recommendation("app", "250m", "200Mi")]);
    mpa
}

fn web_pods(count: usize) -> Vec<Pod> {
    (0..count)
        .map(|i| {
            pod(
                &format!("web-{}", i),
                "web",
                Some(replica_set_owner("web-rs")),
                vec![container("app", 100, 1024)],
            )
        })
        .collect()
}

/// Deployment `web` with `replicas` running pods and an MPA in `mode`
fn cluster_with(replicas: usize, mode: UpdateMode) -> Arc<FakeCluster> {
    let cluster = Arc::new(FakeCluster::new());
    add_deployment(&cluster, "web", "web", replicas as i32);
    cluster.add_mpa(web_mpa(mode));
    for pod in web_pods(replicas) {
        cluster.add_pod(pod);
    }
    cluster
}

fn resizable(mut pod: Pod) -> Pod {
    for container in pod.spec.as_mut().unwrap().containers.iter_mut() {
        container.resize_policy = Some(vec![ContainerResizePolicy {
            resource_name: "cpu".to_string(),
            restart_policy: "NotRequired".to_string(),
        }]);
    }
    pod
}

#[tokio::test]
async fn test_evicts_within_tolerance() {
    let cluster = cluster_with(4, UpdateMode::Auto);
    let mut updater = updater(&cluster, config());

    updater.run_once(now()).await.unwrap();

    assert_eq!(cluster.evicted().len(), 2);
    let reasons = cluster.event_reasons();
    assert_eq!(reasons.iter().filter(|r| *r == "EvictedByMPA").count(), 2);
    assert_eq!(reasons.iter().filter(|r| *r == "EvictedPod").count(), 2);
}

#[tokio::test]
async fn test_two_replicas_evict_one() {
    let cluster = cluster_with(2, UpdateMode::Recreate);
    let mut updater = updater(&cluster, config());

    updater.run_once(now()).await.unwrap();

    assert_eq!(cluster.evicted().len(), 1);
}

#[tokio::test]
async fn test_group_below_min_replicas_is_untouched() {
    let cluster = cluster_with(1, UpdateMode::Auto);
    let mut updater = updater(&cluster, config());

    updater.run_once(now()).await.unwrap();

    assert!(cluster.evicted().is_empty());
}

#[tokio::test]
async fn test_non_updating_modes_are_skipped() {
    for mode in [UpdateMode::Off, UpdateMode::Initial] {
        let cluster = cluster_with(4, mode);
        let mut updater = updater(&cluster, config());

        updater.run_once(now()).await.unwrap();

        assert!(cluster.evicted().is_empty(), "mode {:?} evicted pods", mode);
    }
}

#[tokio::test]
async fn test_pods_within_range_are_kept() {
    let cluster = Arc::new(FakeCluster::new());
    add_deployment(&cluster, "web", "web", 2);
    let mut mpa = web_mpa(UpdateMode::Auto);
    set_recommendation(&mut mpa, vec![flat_recommendation("app", "100m", "1024")]);
    cluster.add_mpa(mpa);
    for pod in web_pods(2) {
        cluster.add_pod(pod);
    }
    let mut updater = updater(&cluster, config());

    updater.run_once(now()).await.unwrap();

    assert!(cluster.evicted().is_empty());
}

#[tokio::test]
async fn test_eviction_failure_moves_on() {
    let cluster = cluster_with(4, UpdateMode::Auto);
    cluster
        .evictions_to_fail
        .lock()
        .unwrap()
        .insert("web-0".to_string());
    let mut updater = updater(&cluster, config());

    updater.run_once(now()).await.unwrap();

    let evicted = cluster.evicted();
    assert_eq!(evicted.len(), 2);
    assert!(!evicted.contains(&"web-0".to_string()));
}

#[tokio::test]
async fn test_transient_pod_list_failure_is_retried() {
    let cluster = cluster_with(4, UpdateMode::Auto);
    cluster.pod_list_failures.store(1, Ordering::SeqCst);
    let mut updater = updater(&cluster, config());

    updater.run_once(now()).await.unwrap();

    assert_eq!(cluster.pod_list_failures.load(Ordering::SeqCst), 0);
    assert_eq!(cluster.evicted().len(), 2);
}

#[tokio::test]
async fn test_terminating_and_finished_pods_are_ignored() {
    let cluster = Arc::new(FakeCluster::new());
    add_deployment(&cluster, "web", "web", 2);
    cluster.add_mpa(web_mpa(UpdateMode::Auto));
    let mut pods = web_pods(2);
    pods[0].metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(t0()));
    pods[1].status.as_mut().unwrap().phase = Some("Succeeded".to_string());
    for pod in pods {
        cluster.add_pod(pod);
    }
    let mut updater = updater(&cluster, config());

    updater.run_once(now()).await.unwrap();

    assert!(cluster.evicted().is_empty());
}

#[tokio::test]
async fn test_configured_rate_limit_still_evicts() {
    let cluster = cluster_with(4, UpdateMode::Auto);
    let mut updater = updater(
        &cluster,
        UpdaterConfig {
            eviction_rate_limit: 1000.0,
            eviction_rate_burst: 2,
            ..config()
        },
    );

    updater.run_once(now()).await.unwrap();

    assert_eq!(cluster.evicted().len(), 2);
}

#[tokio::test]
async fn test_missing_lease_skips_pass() {
    let cluster = cluster_with(4, UpdateMode::Auto);
    let mut updater = updater(
        &cluster,
        UpdaterConfig {
            use_admission_controller_status: true,
            ..config()
        },
    );

    updater.run_once(now()).await.unwrap();

    assert!(cluster.evicted().is_empty());
}

#[tokio::test]
async fn test_stale_lease_skips_pass() {
    let cluster = cluster_with(4, UpdateMode::Auto);
    LeaseRefresher::new(cluster.clone(), LEASE_NAMESPACE, "admission-0")
        .refresh(now() - Duration::minutes(5))
        .await
        .unwrap();
    let mut updater = updater(
        &cluster,
        UpdaterConfig {
            use_admission_controller_status: true,
            ..config()
        },
    );

    updater.run_once(now()).await.unwrap();

    assert!(cluster.evicted().is_empty());
}

#[tokio::test]
async fn test_fresh_lease_allows_pass() {
    let cluster = cluster_with(4, UpdateMode::Auto);
    LeaseRefresher::new(cluster.clone(), LEASE_NAMESPACE, "admission-0")
        .refresh(now() - Duration::seconds(10))
        .await
        .unwrap();
    let mut updater = updater(
        &cluster,
        UpdaterConfig {
            use_admission_controller_status: true,
            ..config()
        },
    );

    updater.run_once(now()).await.unwrap();

    assert_eq!(cluster.evicted().len(), 2);
}

#[tokio::test]
async fn test_in_place_resize_with_gate() {
    let cluster = Arc::new(FakeCluster::new());
    add_deployment(&cluster, "web", "web", 2);
    cluster.add_mpa(web_mpa(UpdateMode::InPlaceOrRecreate));
    for pod in web_pods(2) {
        cluster.add_pod(resizable(pod));
    }
    let mut updater = updater(
        &cluster,
        UpdaterConfig {
            features: FeatureGates {
                in_place_or_recreate: true,
                ..Default::default()
            },
            ..config()
        },
    );

    updater.run_once(now()).await.unwrap();

    let resized = cluster.resized.lock().unwrap().clone();
    assert_eq!(resized.len(), 1);
    assert!(!resized[0].1 .0.is_empty());
    assert!(cluster.evicted().is_empty());
    assert!(cluster
        .event_reasons()
        .contains(&"InPlaceResizedByMPA".to_string()));
}

#[tokio::test]
async fn test_in_place_mode_evicts_without_gate() {
    let cluster = Arc::new(FakeCluster::new());
    add_deployment(&cluster, "web", "web", 2);
    cluster.add_mpa(web_mpa(UpdateMode::InPlaceOrRecreate));
    for pod in web_pods(2) {
        cluster.add_pod(resizable(pod));
    }
    let mut updater = updater(&cluster, config());

    updater.run_once(now()).await.unwrap();

    assert!(cluster.resized.lock().unwrap().is_empty());
    assert_eq!(cluster.evicted().len(), 1);
}

#[tokio::test]
async fn test_in_place_skip_disruption_budget() {
    let cluster = Arc::new(FakeCluster::new());
    add_deployment(&cluster, "web", "web", 2);
    cluster.add_mpa(web_mpa(UpdateMode::InPlaceOrRecreate));
    for pod in web_pods(2) {
        cluster.add_pod(resizable(pod));
    }
    let mut updater = updater(
        &cluster,
        UpdaterConfig {
            in_place_skip_disruption_budget: true,
            features: FeatureGates {
                in_place_or_recreate: true,
                ..Default::default()
            },
            ..config()
        },
    );

    updater.run_once(now()).await.unwrap();

    assert_eq!(cluster.resized.lock().unwrap().len(), 2);
}

fn scaled_mpa(desired: i32, min: i32, max: i32) -> MultidimPodAutoscaler {
    let mut mpa = web_mpa(UpdateMode::Auto);
    mpa.spec.constraints = Some(ScalingConstraints {
        min_replicas: Some(min),
        max_replicas: Some(max),
        ..Default::default()
    });
    mpa.status.get_or_insert_with(Default::default).desired_replicas = Some(desired);
    mpa
}

fn scaled_cluster(mpa: MultidimPodAutoscaler, current: i32) -> Arc<FakeCluster> {
    let cluster = Arc::new(FakeCluster::new());
    add_deployment(&cluster, "web", "web", current);
    cluster.add_scalable(NAMESPACE, "Deployment", "web", current, "app=web", Vec::new());
    cluster.add_mpa(mpa);
    cluster
}

#[tokio::test]
async fn test_desired_replicas_written_to_scale() {
    let cluster = scaled_cluster(scaled_mpa(4, 1, 10), 2);
    let mut updater = updater(&cluster, config());

    updater.run_once_updating_deployment(now()).await.unwrap();

    assert_eq!(
        cluster.scale_updates.lock().unwrap().clone(),
        vec![("default/web".to_string(), 4)]
    );
}

#[tokio::test]
async fn test_vertical_pass_leaves_scale_alone() {
    let cluster = scaled_cluster(scaled_mpa(4, 1, 10), 2);
    let mut updater = updater(&cluster, config());

    updater.run_once(now()).await.unwrap();

    assert!(cluster.scale_updates.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_desired_replicas_outside_bounds_dropped() {
    let cluster = scaled_cluster(scaled_mpa(12, 1, 10), 2);
    let mut updater = updater(&cluster, config());

    updater.run_once_updating_deployment(now()).await.unwrap();

    assert!(cluster.scale_updates.lock().unwrap().is_empty());
    assert!(cluster.event_reasons().is_empty());
}

#[tokio::test]
async fn test_unchanged_replicas_not_written() {
    let cluster = scaled_cluster(scaled_mpa(2, 1, 10), 2);
    let mut updater = updater(&cluster, config());

    updater.run_once_updating_deployment(now()).await.unwrap();

    assert!(cluster.scale_updates.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_scale_records_event() {
    let cluster = Arc::new(FakeCluster::new());
    add_deployment(&cluster, "web", "web", 2);
    cluster.add_mpa(scaled_mpa(4, 1, 10));
    let mut updater = updater(&cluster, config());

    updater.run_once_updating_deployment(now()).await.unwrap();

    assert!(cluster.scale_updates.lock().unwrap().is_empty());
    assert_eq!(cluster.event_reasons(), vec!["FailedGetScale".to_string()]);
}
