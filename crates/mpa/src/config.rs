//! Server configuration
//!
//! Values come from `MPA_*` environment variables (nested sections use `__`,
//! e.g. `MPA_UPDATER__MIN_REPLICAS=3`) and are then overridden by command
//! line flags.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mpa_lib::lease::lease_namespace;
use mpa_lib::model::AggregationsConfig;
use mpa_lib::recommender::{EstimatorConfig, RecommenderConfig, DEFAULT_RECOMMENDER_NAME};
use mpa_lib::updater::UpdaterConfig;
use mpa_lib::FeatureGates;
use serde::Deserialize;

/// Settings shared by every component
#[derive(Debug, Clone, Deserialize)]
pub struct MpaConfig {
    /// Bind address of the health and metrics server
    #[serde(default = "default_address")]
    pub address: String,

    /// Path to a kubeconfig; in-cluster configuration when unset
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    #[serde(default = "default_kube_api_qps")]
    pub kube_api_qps: f32,

    #[serde(default = "default_kube_api_burst")]
    pub kube_api_burst: u32,

    /// Only MPAs in this namespace are handled when set
    #[serde(default)]
    pub mpa_object_namespace: Option<String>,

    /// Namespace of the admission controller lease
    #[serde(default = "lease_namespace")]
    pub lease_namespace: String,

    /// e.g. `NativeSidecar=true,InPlaceOrRecreate=false`
    #[serde(default)]
    pub feature_gates: String,

    #[serde(default)]
    pub recommender: RecommenderSettings,

    #[serde(default)]
    pub updater: UpdaterSettings,

    #[serde(default)]
    pub admission: AdmissionSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecommenderSettings {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_checkpoints_gc_interval_secs")]
    pub checkpoints_gc_interval_secs: u64,

    #[serde(default = "default_interval_secs")]
    pub checkpoints_timeout_secs: u64,

    #[serde(default = "default_min_checkpoints")]
    pub min_checkpoints: usize,

    #[serde(default = "default_aggregate_gc_interval_secs")]
    pub aggregate_gc_interval_secs: u64,

    #[serde(default = "default_recommender_name")]
    pub recommender_name: String,

    /// Relative metric deviation ignored by the horizontal recommendation
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    #[serde(default = "default_downscale_stabilization_secs")]
    pub downscale_stabilization_secs: u64,

    #[serde(default)]
    pub estimator: EstimatorConfig,

    #[serde(default)]
    pub aggregations: AggregationsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdaterSettings {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Evictions per second; zero or less disables the limit
    #[serde(default = "default_eviction_rate_limit")]
    pub eviction_rate_limit: f64,

    #[serde(default = "default_eviction_rate_burst")]
    pub eviction_rate_burst: u32,

    #[serde(default = "default_eviction_tolerance")]
    pub eviction_tolerance: f64,

    #[serde(default = "default_min_replicas")]
    pub min_replicas: usize,

    #[serde(default = "default_true")]
    pub use_admission_controller_status: bool,

    #[serde(default)]
    pub in_place_skip_disruption_budget: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionSettings {
    #[serde(default = "default_webhook_port")]
    pub webhook_port: u16,

    #[serde(default = "default_cert_file")]
    pub cert_file: PathBuf,

    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,

    /// Require client certificates signed by this CA
    #[serde(default)]
    pub client_ca_file: Option<PathBuf>,
}

fn default_address() -> String {
    "0.0.0.0:8942".to_string()
}

fn default_kube_api_qps() -> f32 {
    5.0
}

fn default_kube_api_burst() -> u32 {
    10
}

fn default_interval_secs() -> u64 {
    60
}

fn default_checkpoints_gc_interval_secs() -> u64 {
    600
}

fn default_min_checkpoints() -> usize {
    10
}

fn default_aggregate_gc_interval_secs() -> u64 {
    3600
}

fn default_recommender_name() -> String {
    DEFAULT_RECOMMENDER_NAME.to_string()
}

fn default_tolerance() -> f64 {
    0.1
}

fn default_downscale_stabilization_secs() -> u64 {
    300
}

fn default_eviction_rate_limit() -> f64 {
    -1.0
}

fn default_eviction_rate_burst() -> u32 {
    1
}

fn default_eviction_tolerance() -> f64 {
    0.5
}

fn default_min_replicas() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_webhook_port() -> u16 {
    8000
}

fn default_cert_file() -> PathBuf {
    PathBuf::from("/etc/tls-certs/serverCert.pem")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("/etc/tls-certs/serverKey.pem")
}

impl Default for RecommenderSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            checkpoints_gc_interval_secs: default_checkpoints_gc_interval_secs(),
            checkpoints_timeout_secs: default_interval_secs(),
            min_checkpoints: default_min_checkpoints(),
            aggregate_gc_interval_secs: default_aggregate_gc_interval_secs(),
            recommender_name: default_recommender_name(),
            tolerance: default_tolerance(),
            downscale_stabilization_secs: default_downscale_stabilization_secs(),
            estimator: EstimatorConfig::default(),
            aggregations: AggregationsConfig::default(),
        }
    }
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            eviction_rate_limit: default_eviction_rate_limit(),
            eviction_rate_burst: default_eviction_rate_burst(),
            eviction_tolerance: default_eviction_tolerance(),
            min_replicas: default_min_replicas(),
            use_admission_controller_status: true,
            in_place_skip_disruption_budget: false,
        }
    }
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            webhook_port: default_webhook_port(),
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            client_ca_file: None,
        }
    }
}

impl MpaConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("MPA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration from the environment")?;

        config
            .try_deserialize()
            .context("invalid configuration")
    }

    pub fn features(&self) -> Result<FeatureGates> {
        self.feature_gates
            .parse()
            .with_context(|| format!("invalid feature gates {:?}", self.feature_gates))
    }

    pub fn recommender_config(&self) -> RecommenderConfig {
        let settings = &self.recommender;
        RecommenderConfig {
            interval: Duration::from_secs(settings.interval_secs),
            checkpoints_gc_interval: Duration::from_secs(settings.checkpoints_gc_interval_secs),
            checkpoints_timeout: Duration::from_secs(settings.checkpoints_timeout_secs),
            min_checkpoints: settings.min_checkpoints,
            aggregate_gc_interval: Duration::from_secs(settings.aggregate_gc_interval_secs),
            recommender_name: settings.recommender_name.clone(),
            namespace: self.mpa_object_namespace.clone(),
            tolerance: settings.tolerance,
            downscale_stabilization: Duration::from_secs(settings.downscale_stabilization_secs),
            estimator: settings.estimator.clone(),
            aggregations: settings.aggregations.clone(),
        }
    }

    pub fn updater_config(&self, features: FeatureGates) -> UpdaterConfig {
        let settings = &self.updater;
        UpdaterConfig {
            interval: Duration::from_secs(settings.interval_secs),
            namespace: self.mpa_object_namespace.clone(),
            min_replicas: settings.min_replicas,
            eviction_tolerance: settings.eviction_tolerance,
            eviction_rate_limit: settings.eviction_rate_limit,
            eviction_rate_burst: settings.eviction_rate_burst,
            use_admission_controller_status: settings.use_admission_controller_status,
            in_place_skip_disruption_budget: settings.in_place_skip_disruption_budget,
            lease_namespace: self.lease_namespace.clone(),
            features,
        }
    }
}

/// Multidimensional Pod Autoscaler
#[derive(Debug, Parser)]
#[command(name = "mpa", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Component,

    /// Health and metrics bind address
    #[arg(long, global = true)]
    pub address: Option<String>,

    #[arg(long, global = true, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, global = true)]
    pub kube_api_qps: Option<f32>,

    #[arg(long, global = true)]
    pub kube_api_burst: Option<u32>,

    /// Only handle MPAs in this namespace
    #[arg(long, global = true)]
    pub mpa_object_namespace: Option<String>,

    /// e.g. NativeSidecar=true,InPlaceOrRecreate=true
    #[arg(long, global = true)]
    pub feature_gates: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Component {
    /// Compute recommendations and write them to MPA status
    Recommender(RecommenderArgs),
    /// Apply recommendations to running workloads
    Updater(UpdaterArgs),
    /// Serve the pod mutating and MPA validating webhooks
    AdmissionController(AdmissionArgs),
}

impl Component {
    pub fn name(&self) -> &'static str {
        match self {
            Component::Recommender(_) => "recommender",
            Component::Updater(_) => "updater",
            Component::AdmissionController(_) => "admission-controller",
        }
    }
}

#[derive(Debug, Args)]
pub struct RecommenderArgs {
    /// Seconds between recommendation passes
    #[arg(long)]
    pub recommender_interval: Option<u64>,

    /// Seconds between orphaned checkpoint sweeps
    #[arg(long)]
    pub checkpoints_gc_interval: Option<u64>,

    /// Only serve MPAs selecting this recommender
    #[arg(long)]
    pub recommender_name: Option<String>,

    /// Half-life of CPU usage samples, in seconds
    #[arg(long)]
    pub cpu_histogram_decay_half_life: Option<u64>,

    /// Half-life of memory peaks, in seconds
    #[arg(long)]
    pub memory_histogram_decay_half_life: Option<u64>,

    /// Length of one memory peak interval, in seconds
    #[arg(long)]
    pub memory_aggregation_interval: Option<u64>,

    #[arg(long)]
    pub memory_aggregation_interval_count: Option<u32>,
}

#[derive(Debug, Args)]
pub struct UpdaterArgs {
    /// Seconds between update passes
    #[arg(long)]
    pub updater_interval: Option<u64>,

    /// Evictions per second across all MPAs; zero or less disables the limit
    #[arg(long, allow_hyphen_values = true)]
    pub eviction_rate_limit: Option<f64>,

    #[arg(long)]
    pub eviction_rate_burst: Option<u32>,

    /// Fraction of a replica group that may be evicted at once
    #[arg(long)]
    pub eviction_tolerance: Option<f64>,

    /// Replica groups smaller than this are never evicted
    #[arg(long)]
    pub min_replicas: Option<usize>,

    #[arg(long)]
    pub use_admission_controller_status: Option<bool>,

    #[arg(long)]
    pub in_place_skip_disruption_budget: Option<bool>,
}

#[derive(Debug, Args)]
pub struct AdmissionArgs {
    #[arg(long)]
    pub webhook_port: Option<u16>,

    #[arg(long)]
    pub cert_file: Option<PathBuf>,

    #[arg(long)]
    pub key_file: Option<PathBuf>,

    #[arg(long)]
    pub client_ca_file: Option<PathBuf>,
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

impl Cli {
    /// Overrides `config` with the flags given on the command line
    pub fn apply(&self, config: &mut MpaConfig) {
        set(&mut config.address, self.address.clone());
        if self.kubeconfig.is_some() {
            config.kubeconfig = self.kubeconfig.clone();
        }
        set(&mut config.kube_api_qps, self.kube_api_qps);
        set(&mut config.kube_api_burst, self.kube_api_burst);
        if self.mpa_object_namespace.is_some() {
            config.mpa_object_namespace = self.mpa_object_namespace.clone();
        }
        set(&mut config.feature_gates, self.feature_gates.clone());

        match &self.command {
            Component::Recommender(args) => {
                let r = &mut config.recommender;
                set(&mut r.interval_secs, args.recommender_interval);
                set(&mut r.checkpoints_gc_interval_secs, args.checkpoints_gc_interval);
                set(&mut r.recommender_name, args.recommender_name.clone());
                let a = &mut r.aggregations;
                set(
                    &mut a.cpu_histogram_decay_half_life,
                    args.cpu_histogram_decay_half_life.map(Duration::from_secs),
                );
                set(
                    &mut a.memory_histogram_decay_half_life,
                    args.memory_histogram_decay_half_life.map(Duration::from_secs),
                );
                set(
                    &mut a.memory_aggregation_interval,
                    args.memory_aggregation_interval.map(Duration::from_secs),
                );
                set(&mut a.memory_aggregation_interval_count, args.memory_aggregation_interval_count);
            }
            Component::Updater(args) => {
                let u = &mut config.updater;
                set(&mut u.interval_secs, args.updater_interval);
                set(&mut u.eviction_rate_limit, args.eviction_rate_limit);
                set(&mut u.eviction_rate_burst, args.eviction_rate_burst);
                set(&mut u.eviction_tolerance, args.eviction_tolerance);
                set(&mut u.min_replicas, args.min_replicas);
                set(&mut u.use_admission_controller_status, args.use_admission_controller_status);
                set(&mut u.in_place_skip_disruption_budget, args.in_place_skip_disruption_budget);
            }
            Component::AdmissionController(args) => {
                let a = &mut config.admission;
                set(&mut a.webhook_port, args.webhook_port);
                set(&mut a.cert_file, args.cert_file.clone());
                set(&mut a.key_file, args.key_file.clone());
                if args.client_ca_file.is_some() {
                    a.client_ca_file = args.client_ca_file.clone();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> MpaConfig {
        serde_json::from_str("{}").unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = defaults();
        assert_eq!(config.address, "0.0.0.0:8942");
        assert_eq!(config.updater.min_replicas, 2);
        assert_eq!(config.updater.eviction_rate_limit, -1.0);
        assert!(config.updater.use_admission_controller_status);
        assert_eq!(config.recommender.recommender_name, "default");
        assert_eq!(config.admission.webhook_port, 8000);
        assert_eq!(config.features().unwrap(), FeatureGates::default());
    }

    #[test]
    fn test_flags_override_config() {
        let mut config = defaults();
        let cli = Cli::parse_from([
            "mpa",
            "updater",
            "--eviction-rate-limit",
            "-1",
            "--eviction-tolerance",
            "0.25",
            "--min-replicas",
            "3",
            "--mpa-object-namespace",
            "team-a",
        ]);
        cli.apply(&mut config);

        let updater = config.updater_config(FeatureGates::default());
        assert_eq!(updater.eviction_tolerance, 0.25);
        assert_eq!(updater.min_replicas, 3);
        assert_eq!(updater.eviction_rate_limit, -1.0);
        assert_eq!(updater.namespace.as_deref(), Some("team-a"));
    }

    #[test]
    fn test_recommender_flags() {
        let mut config = defaults();
        let cli = Cli::parse_from([
            "mpa",
            "recommender",
            "--recommender-interval",
            "30",
            "--memory-aggregation-interval-count",
            "4",
            "--feature-gates",
            "NativeSidecar=true",
        ]);
        cli.apply(&mut config);

        let recommender = config.recommender_config();
        assert_eq!(recommender.interval, Duration::from_secs(30));
        assert_eq!(recommender.aggregations.memory_aggregation_interval_count, 4);
        assert!(config.features().unwrap().native_sidecar);
    }

    #[test]
    fn test_invalid_feature_gates() {
        let mut config = defaults();
        config.feature_gates = "Unknown=true".to_string();
        assert!(config.features().is_err());
    }
}
