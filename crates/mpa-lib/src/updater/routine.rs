//! Updater control loop
//!
//! Every tick applies the replica count the recommender settled on and then
//! moves running pods towards their recommended resources, by in-place resize
//! where allowed and by eviction otherwise.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};

use super::priority::UpdatePriorityCalculator;
use super::rate_limit::EvictionRateLimiter;
use super::resize::ResizeTracker;
use super::restriction::{
    EvictionRestriction, EvictionRestrictionFactory, DEFAULT_EVICTION_TOLERANCE, DEFAULT_MIN_REPLICAS,
};
use crate::admission::{patchable_containers, resize_patches, RecommendationProvider};
use crate::client::{
    mpa_reference, EventRecorder, EventType, LeaseClient, LimitRangeClient, MpaClient, PodClient,
};
use crate::crd::{MultidimPodAutoscaler, UpdateMode};
use crate::error::Result;
use crate::features::FeatureGates;
use crate::health::{loops, HealthRegistry};
use crate::lease::{lease_namespace, LeaseChecker};
use crate::observability::{size_bucket, MpaMetrics, StructuredLogger};
use crate::policy::{CappingProcessor, LimitRangeCalculator};
use crate::retry::{retry_with_backoff, with_deadline, RetryConfig};
use crate::target::{controlling_mpa_for_pod, ControllerFetcher, ControllerKey, MpaWithSelector};

const COMPONENT: &str = "updater";

/// Settings of the updater loop
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Time between two update passes (default: 1 minute)
    pub interval: Duration,
    /// Only MPAs of this namespace are updated when set
    pub namespace: Option<String>,
    /// Groups with fewer configured replicas are never evicted
    pub min_replicas: usize,
    /// Fraction of a group that may be disrupted at once
    pub eviction_tolerance: f64,
    /// Evictions per second across all MPAs; zero or less disables the limit
    pub eviction_rate_limit: f64,
    pub eviction_rate_burst: u32,
    /// Skip passes while the admission controller lease is stale
    pub use_admission_controller_status: bool,
    /// Resize pods whose resize policy needs no restart without consulting
    /// the disruption budget
    pub in_place_skip_disruption_budget: bool,
    pub lease_namespace: String,
    pub features: FeatureGates,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            namespace: None,
            min_replicas: DEFAULT_MIN_REPLICAS,
            eviction_tolerance: DEFAULT_EVICTION_TOLERANCE,
            eviction_rate_limit: -1.0,
            eviction_rate_burst: 1,
            use_admission_controller_status: true,
            in_place_skip_disruption_budget: false,
            lease_namespace: lease_namespace(),
            features: FeatureGates::default(),
        }
    }
}

/// Pod counts of one size bucket and update mode
#[derive(Debug, Default, Clone, Copy)]
struct PodCounts {
    controlled: i64,
    evictable: i64,
}

/// Applies recommendations to running workloads
pub struct Updater {
    config: UpdaterConfig,
    mpas: Arc<dyn MpaClient>,
    pods: Arc<dyn PodClient>,
    events: Arc<dyn EventRecorder>,
    fetcher: ControllerFetcher,
    restrictions: EvictionRestrictionFactory,
    limiter: EvictionRateLimiter,
    capping: CappingProcessor,
    provider: RecommendationProvider,
    lease: LeaseChecker,
    tracker: ResizeTracker,
    retry: RetryConfig,
    metrics: MpaMetrics,
    logger: StructuredLogger,
}

impl Updater {
    pub fn new(
        config: UpdaterConfig,
        mpas: Arc<dyn MpaClient>,
        pods: Arc<dyn PodClient>,
        events: Arc<dyn EventRecorder>,
        leases: Arc<dyn LeaseClient>,
        limit_ranges: Arc<dyn LimitRangeClient>,
        fetcher: ControllerFetcher,
    ) -> Self {
        let restrictions = EvictionRestrictionFactory::new(
            fetcher.controllers().clone(),
            config.min_replicas,
            config.eviction_tolerance,
        )
        .with_in_place_skip_disruption_budget(config.in_place_skip_disruption_budget);
        let capping = CappingProcessor::new(LimitRangeCalculator::new(limit_ranges));
        Self {
            limiter: EvictionRateLimiter::new(config.eviction_rate_limit, config.eviction_rate_burst),
            provider: RecommendationProvider::new(capping.clone()),
            lease: LeaseChecker::new(leases, config.lease_namespace.clone()),
            capping,
            restrictions,
            config,
            mpas,
            pods,
            events,
            fetcher,
            tracker: ResizeTracker::new(),
            retry: RetryConfig::default(),
            metrics: MpaMetrics::new(),
            logger: StructuredLogger::new(COMPONENT),
        }
    }

    fn observe_step(&self, step: &str, started: Instant) {
        self.metrics
            .observe_step(COMPONENT, step, started.elapsed().as_secs_f64());
    }

    /// One pass applying vertical recommendations only
    pub async fn run_once(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.run_pass(now, false).await
    }

    /// One pass that first writes desired replica counts to the scale
    /// sub-resource of each target, then applies vertical recommendations
    pub async fn run_once_updating_deployment(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.run_pass(now, true).await
    }

    async fn run_pass(&mut self, now: DateTime<Utc>, update_replicas: bool) -> Result<()> {
        let started = Instant::now();
        if self.config.use_admission_controller_status {
            match self.lease.is_fresh(now).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Admission controller status is stale, skipping update pass");
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "Cannot read admission controller status, skipping update pass");
                    return Err(e);
                }
            }
        }

        let namespace = self.config.namespace.clone();
        let client = &self.mpas;
        let mpas = retry_with_backoff(&self.retry, "list_mpas", || async {
            client.list_mpas(namespace.as_deref()).await
        })
        .await?;
        self.observe_step("list_mpas", started);

        let step = Instant::now();
        let mut active = Vec::new();
        for mpa in mpas {
            let mode = mpa.update_mode();
            if !mode.allows_updates() {
                debug!(mpa = %mpa.id(), mode = mode.as_str(), "Skipping MPA in non-updating mode");
                continue;
            }
            let Some(key) = target_key(&mpa) else {
                debug!(mpa = %mpa.id(), "Skipping MPA without scaleTargetRef");
                continue;
            };
            let selector = match self.fetcher.selector_for(&key).await {
                Ok(selector) => selector,
                Err(e) => {
                    warn!(mpa = %mpa.id(), target = %key, error = %e, "Cannot get target selector");
                    continue;
                }
            };
            if update_replicas {
                self.update_replicas(&mpa, &key).await;
            }
            active.push(MpaWithSelector { mpa, selector });
        }
        if update_replicas {
            self.observe_step("update_replicas", step);
        }

        if active.is_empty() {
            debug!("No MPA objects to process");
            self.metrics.reset_pod_counts();
            self.observe_step("total", started);
            return Ok(());
        }

        let step = Instant::now();
        let all_pods = retry_with_backoff(&self.retry, "list_pods", || async {
            self.pods.list_pods(namespace.as_deref()).await
        })
        .await?;
        let live: Vec<Pod> = all_pods.into_iter().filter(is_live).collect();
        self.tracker.observe(&live, now);
        self.observe_step("list_pods", step);

        let step = Instant::now();
        let mut controlled: Vec<Vec<Pod>> = vec![Vec::new(); active.len()];
        for pod in live {
            let Some(controlling) = controlling_mpa_for_pod(&pod, &active, &self.fetcher).await else {
                continue;
            };
            if let Some(index) = active.iter().position(|c| std::ptr::eq(c, controlling)) {
                controlled[index].push(pod);
            }
        }
        self.observe_step("filter_pods", step);

        let step = Instant::now();
        let mut counts: BTreeMap<(String, String), PodCounts> = BTreeMap::new();
        for (candidate, pods) in active.iter().zip(controlled) {
            if pods.is_empty() {
                continue;
            }
            let mpa = &candidate.mpa;
            let key = (size_bucket(pods.len()), mpa.update_mode().as_str().to_string());
            let evictable = self.update_pods(mpa, &pods, now).await;
            let entry = counts.entry(key).or_default();
            entry.controlled += pods.len() as i64;
            entry.evictable += evictable as i64;
        }
        self.metrics.reset_pod_counts();
        for ((bucket, mode), c) in &counts {
            self.metrics.set_pod_counts(bucket, mode, c.controlled, c.evictable);
        }
        self.observe_step("evict_pods", step);

        self.observe_step("total", started);
        debug!(
            mpas = active.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Update pass complete"
        );
        Ok(())
    }

    /// Writes the recommended replica count of `mpa` to its target when it
    /// differs and lies within the MPA bounds
    async fn update_replicas(&self, mpa: &MultidimPodAutoscaler, key: &ControllerKey) {
        let Some(desired) = mpa.status.as_ref().and_then(|s| s.desired_replicas) else {
            return;
        };
        let reference = mpa_reference(mpa);
        let (mapping, scale) = match self.fetcher.get_scale(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(mpa = %mpa.id(), target = %key, error = %e, "Cannot get target scale");
                self.events
                    .record(&reference, EventType::Warning, "FailedGetScale", &e.to_string())
                    .await;
                return;
            }
        };
        let current = scale.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        if desired == current {
            return;
        }
        if desired < mpa.min_replicas() || desired > mpa.max_replicas() {
            debug!(
                mpa = %mpa.id(),
                desired,
                min = mpa.min_replicas(),
                max = mpa.max_replicas(),
                "Desired replicas outside MPA bounds"
            );
            return;
        }

        let scales = self.fetcher.scales();
        let updated = retry_with_backoff(&self.retry, "update_scale", || async {
            scales
                .update_scale(&mapping, &key.namespace, &key.name, desired)
                .await
        })
        .await;
        match updated {
            Ok(_) => {
                self.metrics.inc_replica_updates();
                self.logger
                    .log_replicas_updated(&mpa.id().to_string(), &key.to_string(), current, desired);
            }
            Err(e) => {
                warn!(mpa = %mpa.id(), target = %key, desired, error = %e, "Failed to rescale target");
                self.events
                    .record(
                        &reference,
                        EventType::Warning,
                        "FailedRescale",
                        &format!("New size: {}; error: {}", desired, e),
                    )
                    .await;
            }
        }
    }

    /// Resizes or evicts the pods of one MPA in priority order and returns how
    /// many of them were candidates
    async fn update_pods(&self, mpa: &MultidimPodAutoscaler, pods: &[Pod], now: DateTime<Utc>) -> usize {
        let Some(recommendation) = mpa.recommendation() else {
            debug!(mpa = %mpa.id(), "MPA has no recommendation yet");
            return 0;
        };
        let mode = mpa.update_mode();
        let in_place = mode == UpdateMode::InPlaceOrRecreate && self.config.features.in_place_or_recreate;
        let mut restriction = self.restrictions.new_restriction(pods).await;

        let mut calculator = UpdatePriorityCalculator::new(mpa.eviction_requirements());
        for pod in pods {
            let eligible = restriction.can_evict(pod, &self.tracker, now)
                || (in_place && restriction.can_in_place_update(pod));
            if !eligible {
                continue;
            }
            let namespace = pod.namespace().unwrap_or_default();
            let containers: Vec<_> = pod
                .spec
                .as_ref()
                .map(|s| s.containers.clone())
                .unwrap_or_default();
            match self
                .capping
                .apply(recommendation, mpa.container_policies(), &namespace, &containers)
                .await
            {
                Ok((processed, _, _)) => calculator.add_pod(pod, &processed, now),
                Err(e) => {
                    warn!(pod = %pod.name_any(), error = %e, "Cannot process recommendation for pod");
                }
            }
        }

        let candidates = calculator.sorted_pods();
        let evictable = candidates.len();
        let bucket = size_bucket(pods.len());
        let mpa_name = mpa.id().to_string();
        for pod in candidates {
            if in_place && restriction.can_in_place_update(&pod) {
                if let Err(e) = self.resize_in_place(mpa, &pod, &mut restriction, &bucket).await {
                    warn!(mpa = %mpa_name, pod = %pod.name_any(), error = %e, "In-place resize failed");
                }
                continue;
            }
            if !restriction.can_evict(&pod, &self.tracker, now) {
                continue;
            }
            self.limiter.wait().await;
            let evicted = restriction
                .evict(
                    &pod,
                    mpa,
                    self.pods.as_ref(),
                    self.events.as_ref(),
                    &self.tracker,
                    now,
                )
                .await;
            match evicted {
                Ok(()) => {
                    self.metrics.inc_evictions(&bucket, mode.as_str());
                    self.logger.log_eviction(&mpa_name, &pod.name_any(), true, "");
                }
                Err(e) => {
                    self.logger
                        .log_eviction(&mpa_name, &pod.name_any(), false, &e.to_string());
                }
            }
        }
        evictable
    }

    async fn resize_in_place(
        &self,
        mpa: &MultidimPodAutoscaler,
        pod: &Pod,
        restriction: &mut EvictionRestriction,
        bucket: &str,
    ) -> Result<()> {
        let containers = patchable_containers(pod, self.config.features.native_sidecar);
        let (resources, _) = self.provider.containers_resources(pod, &containers, mpa).await?;
        let operations = resize_patches(&containers, &resources);
        if operations.is_empty() {
            debug!(pod = %pod.name_any(), "Nothing to resize");
            return Ok(());
        }
        let count = operations.len();
        restriction
            .in_place_update(
                pod,
                &json_patch::Patch(operations),
                self.pods.as_ref(),
                self.events.as_ref(),
            )
            .await?;
        self.metrics.inc_in_place_updates(bucket);
        self.logger
            .log_in_place_resize(&mpa.id().to_string(), &pod.name_any(), count);
        Ok(())
    }

    pub async fn run(mut self, health: HealthRegistry, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            rate_limited = self.limiter.is_limited(),
            "Starting updater loop"
        );
        health.register(loops::UPDATER).await;

        let mut ticker = interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let tick = self.config.interval;
                    let outcome = with_deadline(
                        tick,
                        "updater tick",
                        self.run_once_updating_deployment(Utc::now()),
                    )
                    .await;
                    if let Err(e) = &outcome {
                        self.metrics.inc_failed_ticks(COMPONENT);
                        warn!(error = %e, "Update pass failed");
                    }
                    health.record_tick(loops::UPDATER, &outcome).await;
                }
                _ = shutdown.recv() => {
                    self.logger.log_shutdown("shutdown signal received");
                    break;
                }
            }
        }
    }
}

fn target_key(mpa: &MultidimPodAutoscaler) -> Option<ControllerKey> {
    let target = mpa.spec.scale_target_ref.as_ref()?;
    Some(ControllerKey::new(
        mpa.namespace().unwrap_or_default(),
        target.kind.clone(),
        target.name.clone(),
        target.api_version.clone(),
    ))
}

fn is_live(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    !matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}
