//! Core data models shared by the recommender, admission controller and updater

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Resources the autoscaler manages vertically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceName {
    Cpu,
    Memory,
}

impl ResourceName {
    pub const ALL: [ResourceName; 2] = [ResourceName::Cpu, ResourceName::Memory];

    /// Name used in Kubernetes resource lists
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceName::Cpu => "cpu",
            ResourceName::Memory => "memory",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "cpu" => Some(ResourceName::Cpu),
            "memory" => Some(ResourceName::Memory),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Integer resource amount: millicores for CPU, bytes for memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ResourceAmount(pub i64);

impl ResourceAmount {
    pub const ZERO: ResourceAmount = ResourceAmount(0);
    pub const MAX: ResourceAmount = ResourceAmount(i64::MAX);

    pub fn value(&self) -> i64 {
        self.0
    }

    /// Convert a float to an amount, rounding half to even and clamping to
    /// `[0, i64::MAX]`
    pub fn from_f64(amount: f64) -> Self {
        if amount.is_nan() || amount <= 0.0 {
            ResourceAmount(0)
        } else if amount >= i64::MAX as f64 {
            ResourceAmount::MAX
        } else {
            ResourceAmount(amount.round_ties_even() as i64)
        }
    }

    /// Multiply by `factor`, saturating at the maximum
    pub fn scale(&self, factor: f64) -> Self {
        ResourceAmount::from_f64(self.0 as f64 * factor)
    }

    pub fn saturating_add(&self, other: ResourceAmount) -> Self {
        ResourceAmount(self.0.saturating_add(other.0))
    }
}

/// Millicores for a number of cores
pub fn cpu_amount_from_cores(cores: f64) -> ResourceAmount {
    ResourceAmount::from_f64(cores * 1000.0)
}

/// Cores for a CPU amount
pub fn cores_from_cpu_amount(amount: ResourceAmount) -> f64 {
    amount.0 as f64 / 1000.0
}

/// Memory amount for a number of bytes
pub fn memory_amount_from_bytes(bytes: f64) -> ResourceAmount {
    ResourceAmount::from_f64(bytes)
}

/// Bytes for a memory amount
pub fn bytes_from_memory_amount(amount: ResourceAmount) -> f64 {
    amount.0 as f64
}

/// Per-resource amounts
pub type Resources = BTreeMap<ResourceName, ResourceAmount>;

/// Build a [`Resources`] map from CPU millicores and memory bytes
pub fn resources(cpu_millis: i64, memory_bytes: i64) -> Resources {
    let mut r = Resources::new();
    r.insert(ResourceName::Cpu, ResourceAmount(cpu_millis));
    r.insert(ResourceName::Memory, ResourceAmount(memory_bytes));
    r
}

/// Identity of a pod
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodId {
    pub namespace: String,
    pub pod_name: String,
}

impl PodId {
    pub fn new(namespace: impl Into<String>, pod_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
        }
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod_name)
    }
}

/// Identity of a container inside a pod
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId {
    pub pod_id: PodId,
    pub container_name: String,
}

impl ContainerId {
    pub fn new(pod_id: PodId, container_name: impl Into<String>) -> Self {
        Self {
            pod_id,
            container_name: container_name.into(),
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pod_id, self.container_name)
    }
}

/// Identity of an MPA object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MpaId {
    pub namespace: String,
    pub mpa_name: String,
}

impl MpaId {
    pub fn new(namespace: impl Into<String>, mpa_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            mpa_name: mpa_name.into(),
        }
    }
}

impl fmt::Display for MpaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.mpa_name)
    }
}

/// A single usage measurement of one resource of one container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerUsageSample {
    /// Start of the measurement window
    pub measure_start: DateTime<Utc>,
    /// Average CPU usage or peak memory usage over the window
    pub usage: ResourceAmount,
    /// Request of the container at the time of measurement
    pub request: ResourceAmount,
    pub resource: ResourceName,
}

impl ContainerUsageSample {
    pub fn is_valid(&self, expected: ResourceName) -> bool {
        self.usage.0 >= 0 && self.resource == expected
    }
}

/// A sample paired with the container it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerUsageSampleWithKey {
    pub container: ContainerId,
    pub sample: ContainerUsageSample,
}

/// Usage snapshot of one container as reported by the metrics source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetricsSnapshot {
    pub id: ContainerId,
    pub snapshot_time: DateTime<Utc>,
    pub snapshot_window_secs: i64,
    pub usage: Resources,
}

impl ContainerMetricsSnapshot {
    /// Split the snapshot into one usage sample per resource
    pub fn samples(&self) -> Vec<ContainerUsageSampleWithKey> {
        self.usage
            .iter()
            .map(|(resource, amount)| ContainerUsageSampleWithKey {
                container: self.id.clone(),
                sample: ContainerUsageSample {
                    measure_start: self.snapshot_time,
                    usage: *amount,
                    request: ResourceAmount::ZERO,
                    resource: *resource,
                },
            })
            .collect()
    }
}

/// OOM kill observed for a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OomInfo {
    pub timestamp: DateTime<Utc>,
    pub memory: ResourceAmount,
    pub container: ContainerId,
}

/// Key of an aggregated container state: all containers with the same name
/// in pods with the same labels share one aggregation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateStateKey {
    pub namespace: String,
    pub container_name: String,
    pub labels_key: String,
}

impl fmt::Display for AggregateStateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}[{}]",
            self.namespace, self.container_name, self.labels_key
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_f64_rounds_half_to_even() {
        assert_eq!(ResourceAmount::from_f64(2.5), ResourceAmount(2));
        assert_eq!(ResourceAmount::from_f64(3.5), ResourceAmount(4));
        assert_eq!(ResourceAmount::from_f64(1.4), ResourceAmount(1));
    }

    #[test]
    fn test_from_f64_clamps() {
        assert_eq!(ResourceAmount::from_f64(-5.0), ResourceAmount::ZERO);
        assert_eq!(ResourceAmount::from_f64(f64::NAN), ResourceAmount::ZERO);
        assert_eq!(ResourceAmount::from_f64(f64::INFINITY), ResourceAmount::MAX);
        assert_eq!(ResourceAmount::from_f64(1e30), ResourceAmount::MAX);
    }

    #[test]
    fn test_cpu_conversions() {
        assert_eq!(cpu_amount_from_cores(0.25), ResourceAmount(250));
        assert_eq!(cores_from_cpu_amount(ResourceAmount(1500)), 1.5);
        assert_eq!(memory_amount_from_bytes(1024.0), ResourceAmount(1024));
    }

    #[test]
    fn test_scale_saturates() {
        assert_eq!(ResourceAmount(100).scale(1.5), ResourceAmount(150));
        assert_eq!(ResourceAmount(i64::MAX / 2).scale(4.0), ResourceAmount::MAX);
    }

    #[test]
    fn test_snapshot_splits_into_samples() {
        let snapshot = ContainerMetricsSnapshot {
            id: ContainerId::new(PodId::new("default", "web-1"), "app"),
            snapshot_time: Utc::now(),
            snapshot_window_secs: 30,
            usage: resources(250, 1 << 20),
        };
        let samples = snapshot.samples();
        assert_eq!(samples.len(), 2);
        assert!(samples
            .iter()
            .any(|s| s.sample.resource == ResourceName::Cpu && s.sample.usage.0 == 250));
    }

    #[test]
    fn test_id_display() {
        let id = ContainerId::new(PodId::new("ns", "pod"), "c");
        assert_eq!(id.to_string(), "ns/pod/c");
        assert_eq!(MpaId::new("ns", "mpa").to_string(), "ns/mpa");
    }
}
