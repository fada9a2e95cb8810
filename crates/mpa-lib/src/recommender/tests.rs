use std::sync::Arc;

use chrono::Duration;
use tokio::time::Instant;

use super::*;
use crate::client::fake::FakeCluster;
use crate::crd::{
    condition_types, MultidimPodAutoscalerCheckpoint, MultidimPodAutoscalerCheckpointSpec,
    RecommenderSelector,
};
use crate::model::{AggregationsConfig, ClusterState, PodPhase};
use crate::models::{resources, ContainerId, ContainerMetricsSnapshot, MpaId, PodId};
use crate::target::{ControllerFetcher, Selector};
use crate::testutil::*;

const MIB: i64 = 1024 * 1024;

fn web_cluster() -> Arc<FakeCluster> {
    let cluster = Arc::new(FakeCluster::new());
    add_deployment(&cluster, "web", "web", 2);
    cluster.add_scalable(NAMESPACE, "Deployment", "web", 2, "app=web", Vec::new());
    cluster.add_pod(pod(
        "web-1",
        "web",
        Some(replica_set_owner("web-rs")),
        vec![container("app", 100, 100 * MIB)],
    ));
    cluster.add_mpa(mpa("web-mpa", "Deployment", "web", t0()));
    cluster.metrics.lock().unwrap().push(ContainerMetricsSnapshot {
        id: ContainerId::new(PodId::new(NAMESPACE, "web-1"), "app"),
        snapshot_time: t0(),
        snapshot_window_secs: 60,
        usage: resources(200, 300 * MIB),
    });
    cluster
}

fn fetcher(cluster: &Arc<FakeCluster>) -> ControllerFetcher {
    ControllerFetcher::new(cluster.clone(), cluster.clone())
}

fn recommender(cluster: &Arc<FakeCluster>) -> Recommender {
    Recommender::new(
        RecommenderConfig::default(),
        cluster.clone(),
        cluster.clone(),
        cluster.clone(),
        cluster.clone(),
        fetcher(cluster),
    )
    .unwrap()
}

fn feeder(cluster: &Arc<FakeCluster>) -> ClusterStateFeeder {
    ClusterStateFeeder::new(
        cluster.clone(),
        cluster.clone(),
        cluster.clone(),
        fetcher(cluster),
        DEFAULT_RECOMMENDER_NAME,
        None,
    )
}

fn empty_state() -> ClusterState {
    ClusterState::new(
        AggregationsConfig::default(),
        std::time::Duration::from_secs(3600),
    )
    .unwrap()
}

fn checkpoint(mpa_name: &str, container: &str) -> MultidimPodAutoscalerCheckpoint {
    let mut cp = MultidimPodAutoscalerCheckpoint::new(
        &MultidimPodAutoscalerCheckpoint::object_name(mpa_name, container),
        MultidimPodAutoscalerCheckpointSpec {
            mpa_object_name: mpa_name.to_string(),
            container_name: container.to_string(),
        },
    );
    cp.metadata.namespace = Some(NAMESPACE.to_string());
    cp
}

#[test]
fn test_recommender_name_filter() {
    let mut object = mpa("web-mpa", "Deployment", "web", t0());
    assert!(serves(&object, DEFAULT_RECOMMENDER_NAME));
    assert!(!serves(&object, "custom"));

    object.spec.recommenders = vec![RecommenderSelector {
        name: "custom".to_string(),
    }];
    assert!(serves(&object, "custom"));
    assert!(!serves(&object, DEFAULT_RECOMMENDER_NAME));

    object.spec.recommenders = vec![RecommenderSelector {
        name: DEFAULT_RECOMMENDER_NAME.to_string(),
    }];
    assert!(serves(&object, DEFAULT_RECOMMENDER_NAME));
}

#[tokio::test]
async fn test_run_once_writes_recommendation() {
    let cluster = web_cluster();
    let mut recommender = recommender(&cluster);

    recommender.run_once(t0() + Duration::minutes(1)).await.unwrap();

    let patches = cluster.status_patches.lock().unwrap().clone();
    assert_eq!(patches.len(), 1);
    let (id, status) = &patches[0];
    assert_eq!(*id, MpaId::new(NAMESPACE, "web-mpa"));

    let recommendation = status.container_recommendation("app").unwrap();
    assert!(recommendation.target.contains_key("cpu"));
    assert!(recommendation.target.contains_key("memory"));
    assert!(recommendation.upper_bound.contains_key("cpu"));
    assert!(status
        .condition(condition_types::RECOMMENDATION_PROVIDED)
        .unwrap()
        .is_true());
    // One sample is far less than a day of history.
    assert!(status
        .condition(condition_types::LOW_CONFIDENCE)
        .unwrap()
        .is_true());
    assert!(status.condition(condition_types::NO_PODS_MATCHED).is_none());

    assert_eq!(status.current_replicas, Some(2));
    assert_eq!(status.desired_replicas, Some(2));
}

#[tokio::test]
async fn test_unchanged_status_is_not_written_again() {
    let cluster = web_cluster();
    let mut recommender = recommender(&cluster);

    recommender.run_once(t0() + Duration::minutes(1)).await.unwrap();
    recommender.run_once(t0() + Duration::minutes(2)).await.unwrap();

    assert_eq!(cluster.status_patches.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_run_once_writes_checkpoints() {
    let cluster = web_cluster();
    let mut recommender = recommender(&cluster);

    recommender.run_once(t0() + Duration::minutes(1)).await.unwrap();

    let checkpoints = cluster.checkpoints.lock().unwrap().clone();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].spec.mpa_object_name, "web-mpa");
    assert_eq!(checkpoints[0].spec.container_name, "app");
    let status = checkpoints[0].status.as_ref().unwrap();
    assert_eq!(status.last_update_time, Some(t0() + Duration::minutes(1)));
}

#[tokio::test]
async fn test_restart_restores_history_from_checkpoints() {
    let cluster = web_cluster();
    let mut first = recommender(&cluster);
    first.run_once(t0() + Duration::minutes(1)).await.unwrap();

    let mut restarted = recommender(&cluster);
    restarted.init_from_checkpoints().await.unwrap();

    let mpa = restarted
        .state()
        .mpa(&MpaId::new(NAMESPACE, "web-mpa"))
        .unwrap();
    assert!(mpa.initial_aggregate_states().contains_key("app"));
}

#[tokio::test]
async fn test_mpa_without_pods_reports_no_pods_matched() {
    let cluster = Arc::new(FakeCluster::new());
    add_deployment(&cluster, "web", "web", 1);
    cluster.add_scalable(NAMESPACE, "Deployment", "web", 1, "app=web", Vec::new());
    cluster.add_mpa(mpa("web-mpa", "Deployment", "web", t0()));
    let mut recommender = recommender(&cluster);

    recommender.run_once(t0()).await.unwrap();

    let patches = cluster.status_patches.lock().unwrap().clone();
    let (_, status) = &patches[0];
    assert!(status.recommendation.is_none());
    assert!(status
        .condition(condition_types::NO_PODS_MATCHED)
        .unwrap()
        .is_true());
    assert!(!status
        .condition(condition_types::RECOMMENDATION_PROVIDED)
        .unwrap()
        .is_true());
}

#[tokio::test]
async fn test_target_with_parent_is_unsupported() {
    let cluster = Arc::new(FakeCluster::new());
    add_deployment(&cluster, "web", "web", 2);
    cluster.add_mpa(mpa("rs-mpa", "ReplicaSet", "web-rs", t0()));
    let mut feeder = feeder(&cluster);
    let mut state = empty_state();

    feeder.load_mpas(&mut state).await.unwrap();

    let model = state.mpa(&MpaId::new(NAMESPACE, "rs-mpa")).unwrap();
    assert!(model.pod_selector.is_nothing());
    let condition = model
        .conditions
        .iter()
        .find(|c| c.type_ == condition_types::CONFIG_UNSUPPORTED)
        .unwrap();
    assert!(condition.is_true());
    assert!(condition
        .message
        .as_deref()
        .unwrap()
        .contains("topmost well-known or scalable controller"));
}

#[tokio::test]
async fn test_deleted_mpa_leaves_model() {
    let cluster = web_cluster();
    let mut feeder = feeder(&cluster);
    let mut state = empty_state();

    feeder.load_mpas(&mut state).await.unwrap();
    assert_eq!(state.mpa_ids().len(), 1);

    cluster.mpas.lock().unwrap().clear();
    feeder.load_mpas(&mut state).await.unwrap();
    assert!(state.mpa_ids().is_empty());
    assert!(state.observed_mpas().is_empty());
}

#[tokio::test]
async fn test_pods_and_samples_flow_into_model() {
    let cluster = web_cluster();
    let mut feeder = feeder(&cluster);
    let mut state = empty_state();

    feeder.load_mpas(&mut state).await.unwrap();
    feeder.load_pods(&mut state).await.unwrap();
    let stats = feeder.load_real_time_metrics(&mut state).await.unwrap();
    assert_eq!(stats.added, 2);
    assert_eq!(stats.dropped, 0);

    // The same snapshot again is out of order for CPU.
    let stats = feeder.load_real_time_metrics(&mut state).await.unwrap();
    assert!(stats.dropped >= 1);

    cluster.pods.lock().unwrap().clear();
    feeder.load_pods(&mut state).await.unwrap();
    assert_eq!(state.pods().count(), 0);
}

#[tokio::test]
async fn test_samples_for_unknown_pods_are_dropped() {
    let cluster = web_cluster();
    cluster.pods.lock().unwrap().clear();
    let mut feeder = feeder(&cluster);
    let mut state = empty_state();

    let stats = feeder.load_real_time_metrics(&mut state).await.unwrap();
    assert_eq!(stats.added, 0);
    assert_eq!(stats.dropped, 2);
}

#[tokio::test]
async fn test_checkpoint_gc_deletes_orphans_only() {
    let cluster = web_cluster();
    cluster.checkpoints.lock().unwrap().extend([
        checkpoint("web-mpa", "app"),
        checkpoint("gone", "app"),
    ]);
    let mut feeder = feeder(&cluster);
    let mut state = empty_state();

    let deleted = feeder.garbage_collect_checkpoints(&mut state).await.unwrap();

    assert_eq!(deleted, 1);
    assert_eq!(
        cluster.deleted_checkpoints.lock().unwrap().clone(),
        vec!["default/gone-app".to_string()]
    );
}

#[tokio::test]
async fn test_checkpoint_gc_keeps_checkpoints_of_other_recommenders() {
    let cluster = web_cluster();
    let mut other = mpa("other-mpa", "Deployment", "web", t0());
    other.spec.recommenders = vec![RecommenderSelector {
        name: "custom".to_string(),
    }];
    cluster.add_mpa(other);
    cluster
        .checkpoints
        .lock()
        .unwrap()
        .push(checkpoint("other-mpa", "app"));
    let mut feeder = feeder(&cluster);
    let mut state = empty_state();

    let deleted = feeder.garbage_collect_checkpoints(&mut state).await.unwrap();

    assert_eq!(deleted, 0);
    assert!(state.mpa(&MpaId::new(NAMESPACE, "other-mpa")).is_none());
}

fn state_with_two_mpas() -> ClusterState {
    let mut state = empty_state();
    for app in ["a", "b"] {
        let pod_id = PodId::new(NAMESPACE, format!("{}-1", app));
        state.add_or_update_pod(pod_id.clone(), labels(app), PodPhase::Running);
        state
            .add_or_update_container(&ContainerId::new(pod_id, "app"), resources(100, 100 * MIB))
            .unwrap();
        state
            .add_or_update_mpa(
                &mpa(app, "Deployment", app, t0()),
                Selector::parse(&format!("app={}", app)).unwrap(),
            )
            .unwrap();
    }
    state
}

#[tokio::test]
async fn test_checkpoint_writer_rotates_past_deadline() {
    let cluster = Arc::new(FakeCluster::new());
    let mut writer = CheckpointWriter::new(cluster.clone());
    let state = state_with_two_mpas();
    let expired = Instant::now() - std::time::Duration::from_secs(1);

    let saved = writer.store_checkpoints(&state, t0(), expired, 1).await.unwrap();
    assert_eq!(saved, 1);
    assert!(writer.last_written(&MpaId::new(NAMESPACE, "a")).is_some());
    assert!(writer.last_written(&MpaId::new(NAMESPACE, "b")).is_none());

    let later = t0() + Duration::minutes(1);
    let saved = writer.store_checkpoints(&state, later, expired, 1).await.unwrap();
    assert_eq!(saved, 1);
    assert_eq!(writer.last_written(&MpaId::new(NAMESPACE, "b")), Some(later));

    let mut names: Vec<String> = cluster
        .checkpoints
        .lock()
        .unwrap()
        .iter()
        .map(|c| c.spec.mpa_object_name.clone())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn test_checkpoint_writer_writes_all_before_deadline() {
    let cluster = Arc::new(FakeCluster::new());
    let mut writer = CheckpointWriter::new(cluster.clone());
    let state = state_with_two_mpas();
    let deadline = Instant::now() + std::time::Duration::from_secs(60);

    let saved = writer.store_checkpoints(&state, t0(), deadline, 0).await.unwrap();

    assert_eq!(saved, 2);
}
