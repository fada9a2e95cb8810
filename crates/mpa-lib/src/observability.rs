//! Observability infrastructure for the autoscaler components
//!
//! Provides:
//! - Prometheus metrics for the recommender, updater and admission controller
//! - Structured JSON logging of lifecycle events with tracing

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<MpaMetricsInner> = OnceLock::new();

struct MpaMetricsInner {
    execution_latency_seconds: HistogramVec,
    failed_ticks: IntCounterVec,

    aggregate_container_states: IntGauge,
    mpa_objects: IntGaugeVec,
    recommendations_written: IntCounter,
    checkpoint_writes: IntCounter,
    samples_dropped: IntCounter,

    controlled_pods: IntGaugeVec,
    evictable_pods: IntGaugeVec,
    evictions: IntCounterVec,
    in_place_updates: IntCounterVec,
    replica_updates: IntCounter,

    admission_requests: IntCounterVec,
    admission_latency_seconds: HistogramVec,
    admission_patches: IntCounter,
}

impl MpaMetricsInner {
    fn new() -> Self {
        Self {
            execution_latency_seconds: register_histogram_vec!(
                "mpa_execution_latency_seconds",
                "Time spent in each step of a control loop",
                &["component", "step"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register execution_latency_seconds"),

            failed_ticks: register_int_counter_vec!(
                "mpa_failed_ticks_total",
                "Control loop ticks that ended with an error",
                &["component"]
            )
            .expect("Failed to register failed_ticks"),

            aggregate_container_states: register_int_gauge!(
                "mpa_recommender_aggregate_container_states_count",
                "Number of aggregate container states tracked by the recommender"
            )
            .expect("Failed to register aggregate_container_states"),

            mpa_objects: register_int_gauge_vec!(
                "mpa_recommender_mpa_objects_count",
                "Number of MPA objects by update mode and recommendation presence",
                &["update_mode", "has_recommendation"]
            )
            .expect("Failed to register mpa_objects"),

            recommendations_written: register_int_counter!(
                "mpa_recommender_recommendations_written_total",
                "MPA status updates carrying a recommendation"
            )
            .expect("Failed to register recommendations_written"),

            checkpoint_writes: register_int_counter!(
                "mpa_recommender_checkpoint_writes_total",
                "Checkpoints written by the recommender"
            )
            .expect("Failed to register checkpoint_writes"),

            samples_dropped: register_int_counter!(
                "mpa_recommender_samples_dropped_total",
                "Usage samples dropped as invalid or for untracked containers"
            )
            .expect("Failed to register samples_dropped"),

            controlled_pods: register_int_gauge_vec!(
                "mpa_updater_controlled_pods_count",
                "Pods controlled by MPAs, bucketed by the log2 of the MPA's pod count",
                &["mpa_size_log2", "update_mode"]
            )
            .expect("Failed to register controlled_pods"),

            evictable_pods: register_int_gauge_vec!(
                "mpa_updater_evictable_pods_count",
                "Pods that needed an update, bucketed by the log2 of the MPA's pod count",
                &["mpa_size_log2", "update_mode"]
            )
            .expect("Failed to register evictable_pods"),

            evictions: register_int_counter_vec!(
                "mpa_updater_evicted_pods_total",
                "Pods evicted by the updater",
                &["mpa_size_log2", "update_mode"]
            )
            .expect("Failed to register evictions"),

            in_place_updates: register_int_counter_vec!(
                "mpa_updater_in_place_updated_pods_total",
                "Pods resized in place by the updater",
                &["mpa_size_log2"]
            )
            .expect("Failed to register in_place_updates"),

            replica_updates: register_int_counter!(
                "mpa_updater_replica_updates_total",
                "Scale sub-resource updates made by the updater"
            )
            .expect("Failed to register replica_updates"),

            admission_requests: register_int_counter_vec!(
                "mpa_admission_requests_total",
                "Admission requests by kind of admitted object",
                &["resource"]
            )
            .expect("Failed to register admission_requests"),

            admission_latency_seconds: register_histogram_vec!(
                "mpa_admission_latency_seconds",
                "Time spent handling admission requests",
                &["resource", "status"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register admission_latency_seconds"),

            admission_patches: register_int_counter!(
                "mpa_admission_patches_total",
                "Admission responses carrying a non-empty patch"
            )
            .expect("Failed to register admission_patches"),
        }
    }
}

/// Label for a pod count: the largest power of two not above it
pub fn size_bucket(pods: usize) -> String {
    if pods == 0 {
        return "0".to_string();
    }
    (1usize << (usize::BITS - 1 - pods.leading_zeros())).to_string()
}

/// Autoscaler metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct MpaMetrics {
    _private: (),
}

impl Default for MpaMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MpaMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MpaMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MpaMetricsInner {
        GLOBAL_METRICS.get_or_init(MpaMetricsInner::new)
    }

    /// Record how long one step of a control loop took
    pub fn observe_step(&self, component: &str, step: &str, duration_secs: f64) {
        self.inner()
            .execution_latency_seconds
            .with_label_values(&[component, step])
            .observe(duration_secs);
    }

    pub fn inc_failed_ticks(&self, component: &str) {
        self.inner().failed_ticks.with_label_values(&[component]).inc();
    }

    pub fn set_aggregate_container_states(&self, count: usize) {
        self.inner().aggregate_container_states.set(count as i64);
    }

    /// Replace the MPA object counts with `counts` of (update mode, has recommendation)
    pub fn set_mpa_objects(&self, counts: &[((String, bool), i64)]) {
        let gauge = &self.inner().mpa_objects;
        gauge.reset();
        for ((mode, has_recommendation), count) in counts {
            gauge
                .with_label_values(&[mode, if *has_recommendation { "true" } else { "false" }])
                .set(*count);
        }
    }

    pub fn inc_recommendations_written(&self) {
        self.inner().recommendations_written.inc();
    }

    pub fn add_checkpoint_writes(&self, count: u64) {
        self.inner().checkpoint_writes.inc_by(count);
    }

    pub fn add_samples_dropped(&self, count: u64) {
        self.inner().samples_dropped.inc_by(count);
    }

    /// Set controlled and evictable pod counts of one MPA size bucket
    pub fn set_pod_counts(&self, bucket: &str, update_mode: &str, controlled: i64, evictable: i64) {
        self.inner()
            .controlled_pods
            .with_label_values(&[bucket, update_mode])
            .set(controlled);
        self.inner()
            .evictable_pods
            .with_label_values(&[bucket, update_mode])
            .set(evictable);
    }

    pub fn reset_pod_counts(&self) {
        self.inner().controlled_pods.reset();
        self.inner().evictable_pods.reset();
    }

    pub fn inc_evictions(&self, bucket: &str, update_mode: &str) {
        self.inner()
            .evictions
            .with_label_values(&[bucket, update_mode])
            .inc();
    }

    pub fn inc_in_place_updates(&self, bucket: &str) {
        self.inner().in_place_updates.with_label_values(&[bucket]).inc();
    }

    pub fn inc_replica_updates(&self) {
        self.inner().replica_updates.inc();
    }

    /// Record one admission request and how long it took
    pub fn observe_admission(&self, resource: &str, status: &str, duration_secs: f64, patched: bool) {
        self.inner()
            .admission_requests
            .with_label_values(&[resource])
            .inc();
        self.inner()
            .admission_latency_seconds
            .with_label_values(&[resource, status])
            .observe(duration_secs);
        if patched {
            self.inner().admission_patches.inc();
        }
    }
}

/// Structured logger for autoscaler events
///
/// Emits one `event = "..."` record per notable action so decisions can be
/// followed in the JSON logs.
#[derive(Clone)]
pub struct StructuredLogger {
    component: String,
}

impl StructuredLogger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "component_started",
            component = %self.component,
            version = %version,
            "Component started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "component_shutdown",
            component = %self.component,
            reason = %reason,
            "Component shutting down"
        );
    }

    pub fn log_recommendation(&self, mpa: &str, containers: usize, low_confidence: bool) {
        info!(
            event = "recommendation_written",
            component = %self.component,
            mpa = %mpa,
            containers = containers,
            low_confidence = low_confidence,
            "Recommendation written to MPA status"
        );
    }

    pub fn log_eviction(&self, mpa: &str, pod: &str, success: bool, details: &str) {
        if success {
            info!(
                event = "pod_evicted",
                component = %self.component,
                mpa = %mpa,
                pod = %pod,
                details = %details,
                "Evicted pod to apply recommendation"
            );
        } else {
            warn!(
                event = "pod_eviction_failed",
                component = %self.component,
                mpa = %mpa,
                pod = %pod,
                details = %details,
                "Failed to evict pod"
            );
        }
    }

    pub fn log_in_place_resize(&self, mpa: &str, pod: &str, patch_operations: usize) {
        info!(
            event = "pod_resized_in_place",
            component = %self.component,
            mpa = %mpa,
            pod = %pod,
            patch_operations = patch_operations,
            "Resized pod in place"
        );
    }

    pub fn log_replicas_updated(&self, mpa: &str, target: &str, from: i32, to: i32) {
        info!(
            event = "replicas_updated",
            component = %self.component,
            mpa = %mpa,
            target = %target,
            from = from,
            to = to,
            "Updated target replica count"
        );
    }

    pub fn log_checkpoint_gc(&self, deleted: usize) {
        info!(
            event = "checkpoints_garbage_collected",
            component = %self.component,
            deleted = deleted,
            "Deleted orphaned checkpoints"
        );
    }

    pub fn log_webhook_patch(&self, mpa: &str, pod: &str, operations: usize) {
        info!(
            event = "webhook_patch_produced",
            component = %self.component,
            mpa = %mpa,
            pod = %pod,
            operations = operations,
            "Produced admission patch"
        );
    }
}
