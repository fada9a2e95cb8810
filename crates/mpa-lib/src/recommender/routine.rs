//! Recommender control loop
//!
//! Every tick refreshes the cluster model, computes vertical and horizontal
//! recommendations for each served MPA, writes changed statuses and keeps
//! checkpoints current.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};

use super::checkpoint::{CheckpointWriter, DEFAULT_MIN_CHECKPOINTS};
use super::feeder::{ClusterStateFeeder, DEFAULT_RECOMMENDER_NAME};
use super::horizontal::{HorizontalController, DEFAULT_DOWNSCALE_STABILIZATION};
use super::pod::{capped_recommendation, has_low_confidence, EstimatorConfig, PodResourceRecommender};
use super::replicas::{ReplicaCalculator, DEFAULT_TOLERANCE};
use crate::client::{EventRecorder, MetricsClient, MpaClient, PodClient};
use crate::crd::{condition_types, MultidimPodAutoscaler};
use crate::error::{Error, Result};
use crate::health::{loops, HealthRegistry};
use crate::model::{AggregationsConfig, ClusterState};
use crate::models::MpaId;
use crate::observability::{MpaMetrics, StructuredLogger};
use crate::retry::{retry_with_backoff, with_deadline, RetryConfig};
use crate::target::ControllerFetcher;

const COMPONENT: &str = "recommender";

/// Settings of the recommender loop
#[derive(Debug, Clone)]
pub struct RecommenderConfig {
    /// Time between two recommendation passes (default: 1 minute)
    pub interval: Duration,
    /// Time between two orphaned checkpoint sweeps (default: 10 minutes)
    pub checkpoints_gc_interval: Duration,
    /// Budget for checkpoint writes in one pass (default: 1 minute)
    pub checkpoints_timeout: Duration,
    /// MPAs checkpointed per pass even past the budget
    pub min_checkpoints: usize,
    /// Time between two aggregate state sweeps (default: 1 hour)
    pub aggregate_gc_interval: Duration,
    pub recommender_name: String,
    /// Only MPAs of this namespace are served when set
    pub namespace: Option<String>,
    pub tolerance: f64,
    pub downscale_stabilization: Duration,
    pub estimator: EstimatorConfig,
    pub aggregations: AggregationsConfig,
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            checkpoints_gc_interval: Duration::from_secs(600),
            checkpoints_timeout: Duration::from_secs(60),
            min_checkpoints: DEFAULT_MIN_CHECKPOINTS,
            aggregate_gc_interval: Duration::from_secs(3600),
            recommender_name: DEFAULT_RECOMMENDER_NAME.to_string(),
            namespace: None,
            tolerance: DEFAULT_TOLERANCE,
            downscale_stabilization: DEFAULT_DOWNSCALE_STABILIZATION
                .to_std()
                .unwrap_or(Duration::from_secs(300)),
            estimator: EstimatorConfig::default(),
            aggregations: AggregationsConfig::default(),
        }
    }
}

/// Outcome of writing one MPA's status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusWrite {
    Unchanged,
    Written,
}

/// Computes recommendations for every served MPA and writes them back
pub struct Recommender {
    config: RecommenderConfig,
    state: ClusterState,
    feeder: ClusterStateFeeder,
    checkpoints: CheckpointWriter,
    estimator: PodResourceRecommender,
    horizontal: HorizontalController,
    mpas: Arc<dyn MpaClient>,
    retry: RetryConfig,
    metrics: MpaMetrics,
    logger: StructuredLogger,
    last_checkpoint_gc: Option<DateTime<Utc>>,
}

impl Recommender {
    pub fn new(
        config: RecommenderConfig,
        mpas: Arc<dyn MpaClient>,
        pods: Arc<dyn PodClient>,
        usage: Arc<dyn MetricsClient>,
        events: Arc<dyn EventRecorder>,
        fetcher: ControllerFetcher,
    ) -> Result<Self> {
        let state = ClusterState::new(config.aggregations.clone(), config.aggregate_gc_interval)?;
        let feeder = ClusterStateFeeder::new(
            mpas.clone(),
            pods.clone(),
            usage.clone(),
            fetcher.clone(),
            config.recommender_name.clone(),
            config.namespace.clone(),
        );
        let downscale_stabilization = chrono::Duration::from_std(config.downscale_stabilization)
            .map_err(|e| Error::config(format!("invalid downscale stabilization window: {}", e)))?;
        let horizontal = HorizontalController::new(
            fetcher,
            pods,
            usage,
            events,
            ReplicaCalculator::new(config.tolerance),
            downscale_stabilization,
        );
        Ok(Self {
            estimator: PodResourceRecommender::new(&config.estimator),
            checkpoints: CheckpointWriter::new(mpas.clone()),
            config,
            state,
            feeder,
            horizontal,
            mpas,
            retry: RetryConfig::default(),
            metrics: MpaMetrics::new(),
            logger: StructuredLogger::new(COMPONENT),
            last_checkpoint_gc: None,
        })
    }

    /// The cluster model as of the last pass
    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    fn observe_step(&self, step: &str, started: Instant) {
        self.metrics
            .observe_step(COMPONENT, step, started.elapsed().as_secs_f64());
    }

    /// Loads checkpointed history. Called once before the first pass.
    pub async fn init_from_checkpoints(&mut self) -> Result<()> {
        self.feeder.init_from_checkpoints(&mut self.state).await
    }

    /// One recommendation pass
    pub async fn run_once(&mut self, now: DateTime<Utc>) -> Result<()> {
        let started = Instant::now();
        self.feeder.load_mpas(&mut self.state).await?;
        self.observe_step("load_mpas", started);

        let step = Instant::now();
        self.feeder.load_pods(&mut self.state).await?;
        self.observe_step("load_pods", step);

        let step = Instant::now();
        match self.feeder.load_real_time_metrics(&mut self.state).await {
            Ok(stats) => self.metrics.add_samples_dropped(stats.dropped as u64),
            Err(e) => warn!(error = %e, "Cannot load real time metrics"),
        }
        self.observe_step("load_metrics", step);

        let step = Instant::now();
        self.update_mpas(now).await;
        self.observe_step("update_mpas", step);

        let step = Instant::now();
        self.maintain_checkpoints(now).await;
        self.observe_step("maintain_checkpoints", step);

        let live_targets: HashSet<MpaId> = self
            .state
            .mpas()
            .filter(|mpa| {
                !mpa.conditions
                    .iter()
                    .any(|c| c.type_ == condition_types::CONFIG_UNSUPPORTED && c.is_true())
            })
            .map(|mpa| mpa.id.clone())
            .collect();
        self.state
            .rate_limited_garbage_collect_aggregate_states(now, &live_targets);
        self.metrics
            .set_aggregate_container_states(self.state.aggregate_state_count());

        self.observe_step("total", started);
        debug!(
            mpas = self.state.mpa_ids().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Recommendation pass complete"
        );
        Ok(())
    }

    async fn update_mpas(&mut self, now: DateTime<Utc>) {
        let objects: Vec<MultidimPodAutoscaler> = self.state.observed_mpas().to_vec();
        let mut counts: BTreeMap<(String, bool), i64> = BTreeMap::new();
        for object in &objects {
            let id = object.id();
            if let Err(e) = self.update_mpa(object, now).await {
                warn!(mpa = %id, error = %e, "Failed to update MPA");
            }
            if let Some(mpa) = self.state.mpa(&id) {
                *counts
                    .entry((mpa.update_mode.as_str().to_string(), mpa.has_recommendation()))
                    .or_insert(0) += 1;
            }
        }
        let live: HashSet<MpaId> = objects.iter().map(|o| o.id()).collect();
        self.horizontal.retain(|id| live.contains(id));
        self.metrics
            .set_mpa_objects(&counts.into_iter().collect::<Vec<_>>());
    }

    async fn update_mpa(&mut self, object: &MultidimPodAutoscaler, now: DateTime<Utc>) -> Result<()> {
        let id = object.id();
        let states = self.state.aggregate_state_by_container_name(&id)?;
        let bounds = self.estimator.recommend(&states);
        let low_confidence = !states.is_empty() && has_low_confidence(&states);
        let pod_count = self
            .state
            .mpa(&id)
            .map(|mpa| self.state.matching_pods(mpa).len())
            .unwrap_or(0);

        let mpa = self
            .state
            .mpa_mut(&id)
            .ok_or_else(|| Error::unknown_key(id.to_string()))?;
        mpa.pod_count = pod_count;
        let recommendation =
            (!bounds.is_empty()).then(|| capped_recommendation(&bounds, &mpa.container_policies));
        mpa.update_recommendation(recommendation);
        mpa.update_conditions(pod_count > 0);
        if mpa.has_recommendation() && low_confidence {
            mpa.set_condition(
                condition_types::LOW_CONFIDENCE,
                true,
                "LowConfidence",
                "Less than a day of usage history is available",
            );
        } else {
            mpa.remove_condition(condition_types::LOW_CONFIDENCE);
        }

        if mpa.scale_target_ref.is_some() {
            if let Err(e) = self.horizontal.reconcile(object, mpa, now).await {
                debug!(mpa = %id, error = %e, "Horizontal reconciliation failed");
            }
        }

        if let Err(e) = self.state.record_recommendation(&id, now) {
            warn!(mpa = %id, error = %e, "MPA has no recommendation");
        }

        if self.write_status(object, low_confidence).await? == StatusWrite::Written {
            debug!(mpa = %id, "Updated MPA status");
        }
        Ok(())
    }

    /// Patches the status when it differs from the last observed one
    async fn write_status(
        &self,
        object: &MultidimPodAutoscaler,
        low_confidence: bool,
    ) -> Result<StatusWrite> {
        let id = object.id();
        let mpa = self
            .state
            .mpa(&id)
            .ok_or_else(|| Error::unknown_key(id.to_string()))?;
        let status = mpa.as_status();
        if object.status.as_ref() == Some(&status) {
            return Ok(StatusWrite::Unchanged);
        }

        let client = &self.mpas;
        retry_with_backoff(&self.retry, "patch_mpa_status", || async {
            client.patch_mpa_status(&id, &status).await
        })
        .await?;

        if let Some(recommendation) = &status.recommendation {
            self.metrics.inc_recommendations_written();
            self.logger.log_recommendation(
                &id.to_string(),
                recommendation.container_recommendations.len(),
                low_confidence,
            );
        }
        Ok(StatusWrite::Written)
    }

    async fn maintain_checkpoints(&mut self, now: DateTime<Utc>) {
        let deadline = Instant::now() + self.config.checkpoints_timeout;
        match self
            .checkpoints
            .store_checkpoints(&self.state, now, deadline, self.config.min_checkpoints)
            .await
        {
            Ok(saved) => self.metrics.add_checkpoint_writes(saved as u64),
            Err(e) => error!(error = %e, "Failed to store checkpoints"),
        }

        let gc_interval = chrono::Duration::from_std(self.config.checkpoints_gc_interval)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let due = self
            .last_checkpoint_gc
            .map_or(true, |last| now - last >= gc_interval);
        if !due {
            return;
        }
        self.last_checkpoint_gc = Some(now);
        match self.feeder.garbage_collect_checkpoints(&mut self.state).await {
            Ok(0) => debug!("No orphaned checkpoints"),
            Ok(deleted) => self.logger.log_checkpoint_gc(deleted),
            Err(e) => error!(error = %e, "Checkpoint garbage collection failed"),
        }
    }

    /// Runs passes until `shutdown` fires. Each pass is bounded by the
    /// loop interval.
    pub async fn run(mut self, health: HealthRegistry, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            recommender = %self.config.recommender_name,
            "Starting recommender loop"
        );
        health.register(loops::RECOMMENDER).await;
        if let Err(e) = self.init_from_checkpoints().await {
            error!(error = %e, "Failed to initialize from checkpoints");
        }

        let mut ticker = interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let tick = self.config.interval;
                    let outcome = with_deadline(tick, "recommender tick", self.run_once(Utc::now())).await;
                    if let Err(e) = &outcome {
                        self.metrics.inc_failed_ticks(COMPONENT);
                        warn!(error = %e, "Recommendation pass failed");
                    }
                    health.record_tick(loops::RECOMMENDER, &outcome).await;
                }
                _ = shutdown.recv() => {
                    self.logger.log_shutdown("shutdown signal received");
                    break;
                }
            }
        }
    }
}
