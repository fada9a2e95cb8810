use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::histogram::HistogramOptions;

/// Minimal weight of a CPU sample, in cores
pub const MIN_SAMPLE_WEIGHT: f64 = 0.1;

/// Bucket weights below this are treated as empty
pub const EPSILON: f64 = 0.001 * MIN_SAMPLE_WEIGHT;

const DEFAULT_MEMORY_AGGREGATION_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const DEFAULT_MEMORY_AGGREGATION_INTERVAL_COUNT: u32 = 8;
const DEFAULT_HISTOGRAM_BUCKET_SIZE_GROWTH: f64 = 0.05;
const DEFAULT_HALF_LIFE: Duration = Duration::from_secs(24 * 3600);
const DEFAULT_OOM_BUMP_UP_RATIO: f64 = 1.2;
const DEFAULT_OOM_MIN_BUMP_UP_BYTES: f64 = 100.0 * 1024.0 * 1024.0;

/// Tunables for how usage samples are aggregated
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AggregationsConfig {
    /// Length of one memory peak interval
    #[serde(default = "default_memory_aggregation_interval", with = "duration_secs")]
    pub memory_aggregation_interval: Duration,

    /// Number of intervals kept in the memory window
    #[serde(default = "default_memory_aggregation_interval_count")]
    pub memory_aggregation_interval_count: u32,

    #[serde(default = "default_bucket_size_growth")]
    pub histogram_bucket_size_growth: f64,

    #[serde(default = "default_half_life", with = "duration_secs")]
    pub memory_histogram_decay_half_life: Duration,

    #[serde(default = "default_half_life", with = "duration_secs")]
    pub cpu_histogram_decay_half_life: Duration,

    /// Memory recorded for an OOM is at least the used memory times this ratio
    #[serde(default = "default_oom_bump_up_ratio")]
    pub oom_bump_up_ratio: f64,

    /// Memory recorded for an OOM is at least the used memory plus this many bytes
    #[serde(default = "default_oom_min_bump_up_bytes")]
    pub oom_min_bump_up_bytes: f64,
}

fn default_memory_aggregation_interval() -> Duration {
    DEFAULT_MEMORY_AGGREGATION_INTERVAL
}

fn default_memory_aggregation_interval_count() -> u32 {
    DEFAULT_MEMORY_AGGREGATION_INTERVAL_COUNT
}

fn default_bucket_size_growth() -> f64 {
    DEFAULT_HISTOGRAM_BUCKET_SIZE_GROWTH
}

fn default_half_life() -> Duration {
    DEFAULT_HALF_LIFE
}

fn default_oom_bump_up_ratio() -> f64 {
    DEFAULT_OOM_BUMP_UP_RATIO
}

fn default_oom_min_bump_up_bytes() -> f64 {
    DEFAULT_OOM_MIN_BUMP_UP_BYTES
}

impl Default for AggregationsConfig {
    fn default() -> Self {
        Self {
            memory_aggregation_interval: DEFAULT_MEMORY_AGGREGATION_INTERVAL,
            memory_aggregation_interval_count: DEFAULT_MEMORY_AGGREGATION_INTERVAL_COUNT,
            histogram_bucket_size_growth: DEFAULT_HISTOGRAM_BUCKET_SIZE_GROWTH,
            memory_histogram_decay_half_life: DEFAULT_HALF_LIFE,
            cpu_histogram_decay_half_life: DEFAULT_HALF_LIFE,
            oom_bump_up_ratio: DEFAULT_OOM_BUMP_UP_RATIO,
            oom_min_bump_up_bytes: DEFAULT_OOM_MIN_BUMP_UP_BYTES,
        }
    }
}

impl AggregationsConfig {
    /// Span of memory history kept per container
    pub fn memory_aggregation_window(&self) -> Duration {
        self.memory_aggregation_interval * self.memory_aggregation_interval_count
    }

    /// Buckets from 0.01 core up to 1000 cores
    pub fn cpu_histogram_options(&self) -> Result<HistogramOptions> {
        HistogramOptions::exponential(
            1000.0,
            0.01,
            1.0 + self.histogram_bucket_size_growth,
            EPSILON,
        )
    }

    /// Buckets from 10MB up to 1TB
    pub fn memory_histogram_options(&self) -> Result<HistogramOptions> {
        HistogramOptions::exponential(
            1e12,
            1e7,
            1.0 + self.histogram_bucket_size_growth,
            EPSILON,
        )
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AggregationsConfig::default();
        assert_eq!(
            config.memory_aggregation_window(),
            Duration::from_secs(8 * 24 * 3600)
        );
        assert!(config.cpu_histogram_options().is_ok());
        assert!(config.memory_histogram_options().is_ok());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: AggregationsConfig =
            serde_json::from_str(r#"{"memory_aggregation_interval_count": 4}"#).unwrap();
        assert_eq!(config.memory_aggregation_interval_count, 4);
        assert_eq!(config.oom_bump_up_ratio, 1.2);
    }
}
