use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::aggregations::{AggregationsConfig, MIN_SAMPLE_WEIGHT};
use crate::crd::{MultidimPodAutoscalerCheckpointStatus, UpdateMode, CHECKPOINT_VERSION};
use crate::error::{Error, Result};
use crate::histogram::{DecayingHistogram, HistogramOptions};
use crate::models::{
    bytes_from_memory_amount, cores_from_cpu_amount, ContainerUsageSample, ResourceName,
    Resources,
};

/// Histogram layouts and half-lives shared by every aggregate state
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramLayout {
    pub cpu_options: HistogramOptions,
    pub memory_options: HistogramOptions,
    pub cpu_half_life: Duration,
    pub memory_half_life: Duration,
    /// States without samples for this long are garbage collected
    pub memory_aggregation_window: Duration,
}

impl HistogramLayout {
    pub fn new(config: &AggregationsConfig) -> Result<Self> {
        Ok(Self {
            cpu_options: config.cpu_histogram_options()?,
            memory_options: config.memory_histogram_options()?,
            cpu_half_life: config.cpu_histogram_decay_half_life,
            memory_half_life: config.memory_histogram_decay_half_life,
            memory_aggregation_window: config.memory_aggregation_window(),
        })
    }
}

/// Usage of all containers sharing a name under one set of pod labels
///
/// First/last sample timestamps and the sample count track CPU samples only.
#[derive(Debug, Clone)]
pub struct AggregateContainerState {
    pub cpu_usage: DecayingHistogram,
    pub memory_peaks: DecayingHistogram,
    pub first_sample_start: Option<DateTime<Utc>>,
    pub last_sample_start: Option<DateTime<Utc>>,
    pub total_samples_count: i64,
    pub creation_time: DateTime<Utc>,
    pub last_recommendation: Option<Resources>,
    pub is_under_mpa: bool,
    pub update_mode: Option<UpdateMode>,
    memory_aggregation_window: Duration,
}

impl AggregateContainerState {
    pub fn new(layout: &HistogramLayout, creation_time: DateTime<Utc>) -> Self {
        Self {
            cpu_usage: DecayingHistogram::new(layout.cpu_options, layout.cpu_half_life),
            memory_peaks: DecayingHistogram::new(layout.memory_options, layout.memory_half_life),
            first_sample_start: None,
            last_sample_start: None,
            total_samples_count: 0,
            creation_time,
            last_recommendation: None,
            is_under_mpa: false,
            update_mode: None,
            memory_aggregation_window: layout.memory_aggregation_window,
        }
    }

    pub fn add_sample(&mut self, sample: &ContainerUsageSample) {
        match sample.resource {
            ResourceName::Cpu => self.add_cpu_sample(sample),
            ResourceName::Memory => self.memory_peaks.add_sample(
                bytes_from_memory_amount(sample.usage),
                1.0,
                sample.measure_start,
            ),
        }
    }

    /// Removes a memory peak added earlier. CPU samples are never subtracted.
    pub fn subtract_sample(&mut self, sample: &ContainerUsageSample) {
        if sample.resource == ResourceName::Memory {
            self.memory_peaks.subtract_sample(
                bytes_from_memory_amount(sample.usage),
                1.0,
                sample.measure_start,
            );
        }
    }

    fn add_cpu_sample(&mut self, sample: &ContainerUsageSample) {
        let usage = cores_from_cpu_amount(sample.usage);
        let request = cores_from_cpu_amount(sample.request);
        // Weighted by request so raising the request decays older history faster.
        self.cpu_usage
            .add_sample(usage, request.max(MIN_SAMPLE_WEIGHT), sample.measure_start);
        if self.last_sample_start.map_or(true, |last| sample.measure_start > last) {
            self.last_sample_start = Some(sample.measure_start);
        }
        if self.first_sample_start.map_or(true, |first| sample.measure_start < first) {
            self.first_sample_start = Some(sample.measure_start);
        }
        self.total_samples_count += 1;
    }

    pub fn mark_not_autoscaled(&mut self) {
        self.is_under_mpa = false;
        self.last_recommendation = None;
        self.update_mode = None;
    }

    pub fn merge(&mut self, other: &AggregateContainerState) -> Result<()> {
        self.cpu_usage.merge(&other.cpu_usage)?;
        self.memory_peaks.merge(&other.memory_peaks)?;
        if let Some(theirs) = other.first_sample_start {
            if self.first_sample_start.map_or(true, |mine| theirs < mine) {
                self.first_sample_start = Some(theirs);
            }
        }
        if let Some(theirs) = other.last_sample_start {
            if self.last_sample_start.map_or(true, |mine| theirs > mine) {
                self.last_sample_start = Some(theirs);
            }
        }
        self.total_samples_count += other.total_samples_count;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.total_samples_count == 0
    }

    /// No sample within the memory aggregation window
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(self.memory_aggregation_window)
            .unwrap_or_else(|_| chrono::Duration::days(8));
        let since = match self.last_sample_start {
            Some(last) if !self.is_empty() => last,
            _ => self.creation_time,
        };
        now - since >= window
    }

    /// Length of observed history, in days
    pub fn lifespan_days(&self) -> f64 {
        match (self.first_sample_start, self.last_sample_start) {
            (Some(first), Some(last)) => {
                (last - first).num_milliseconds().max(0) as f64 / (24.0 * 3600.0 * 1000.0)
            }
            _ => 0.0,
        }
    }

    pub fn save_to_checkpoint(&self) -> MultidimPodAutoscalerCheckpointStatus {
        MultidimPodAutoscalerCheckpointStatus {
            last_update_time: None,
            version: CHECKPOINT_VERSION.to_string(),
            cpu_histogram: self.cpu_usage.save_to_checkpoint(),
            memory_histogram: self.memory_peaks.save_to_checkpoint(),
            first_sample_start: self.first_sample_start,
            last_sample_start: self.last_sample_start,
            total_samples_count: self.total_samples_count,
        }
    }

    pub fn load_from_checkpoint(
        &mut self,
        checkpoint: &MultidimPodAutoscalerCheckpointStatus,
    ) -> Result<()> {
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(Error::checkpoint(format!(
                "unsupported checkpoint version {:?}",
                checkpoint.version
            )));
        }
        self.total_samples_count = checkpoint.total_samples_count;
        self.first_sample_start = checkpoint.first_sample_start;
        self.last_sample_start = checkpoint.last_sample_start;
        self.memory_peaks
            .load_from_checkpoint(&checkpoint.memory_histogram)?;
        self.cpu_usage.load_from_checkpoint(&checkpoint.cpu_histogram)?;
        Ok(())
    }
}

/// Aggregations merged by container name
pub type ContainerNameToAggregateStateMap = BTreeMap<String, AggregateContainerState>;
