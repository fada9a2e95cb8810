use chrono::{DateTime, Utc};

use super::aggregate::AggregateContainerState;
use super::aggregations::AggregationsConfig;
use crate::error::{Error, Result};
use crate::models::{
    memory_amount_from_bytes, ContainerUsageSample, ResourceAmount, ResourceName, Resources,
};

/// Live state of one container of one pod
///
/// The container keeps the peak of the current memory interval so that a
/// higher sample in the same interval replaces the earlier peak in the
/// aggregate instead of adding a second one.
#[derive(Debug, Clone, Default)]
pub struct ContainerState {
    pub request: Resources,
    pub last_cpu_sample_start: Option<DateTime<Utc>>,
    memory_peak: ResourceAmount,
    oom_peak: ResourceAmount,
    /// End of the current memory aggregation interval
    pub window_end: Option<DateTime<Utc>>,
    last_memory_sample_start: Option<DateTime<Utc>>,
}

impl ContainerState {
    pub fn new(request: Resources) -> Self {
        Self {
            request,
            ..Default::default()
        }
    }

    pub fn max_memory_peak(&self) -> ResourceAmount {
        self.memory_peak.max(self.oom_peak)
    }

    /// Feeds a sample into `aggregate`. Returns false when the sample is
    /// invalid, duplicated or older than the last accepted one.
    pub fn add_sample(
        &mut self,
        sample: &ContainerUsageSample,
        aggregate: &mut AggregateContainerState,
        config: &AggregationsConfig,
    ) -> bool {
        let mut sample = sample.clone();
        if sample.request == ResourceAmount::ZERO {
            if let Some(request) = self.request.get(&sample.resource) {
                sample.request = *request;
            }
        }
        match sample.resource {
            ResourceName::Cpu => self.add_cpu_sample(&sample, aggregate),
            ResourceName::Memory => self.add_memory_sample(&sample, false, aggregate, config),
        }
    }

    fn add_cpu_sample(
        &mut self,
        sample: &ContainerUsageSample,
        aggregate: &mut AggregateContainerState,
    ) -> bool {
        if !sample.is_valid(ResourceName::Cpu) {
            return false;
        }
        if let Some(last) = self.last_cpu_sample_start {
            if sample.measure_start <= last {
                return false;
            }
        }
        aggregate.add_sample(sample);
        self.last_cpu_sample_start = Some(sample.measure_start);
        true
    }

    fn add_memory_sample(
        &mut self,
        sample: &ContainerUsageSample,
        is_oom: bool,
        aggregate: &mut AggregateContainerState,
        config: &AggregationsConfig,
    ) -> bool {
        let ts = sample.measure_start;
        if !sample.is_valid(ResourceName::Memory) {
            return false;
        }
        if !is_oom && self.last_memory_sample_start.map_or(false, |last| ts < last) {
            return false;
        }
        self.last_memory_sample_start = Some(ts);
        let window_end = *self.window_end.get_or_insert(ts);

        let mut add_new_peak = false;
        if ts < window_end {
            let old_max = self.max_memory_peak();
            if old_max != ResourceAmount::ZERO && sample.usage > old_max {
                aggregate.subtract_sample(&ContainerUsageSample {
                    measure_start: window_end,
                    usage: old_max,
                    request: sample.request,
                    resource: ResourceName::Memory,
                });
                add_new_peak = true;
            }
        } else {
            // Jump to the interval containing ts; skipped intervals stay empty.
            let interval = chrono::Duration::from_std(config.memory_aggregation_interval)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
            let interval_ms = interval.num_milliseconds().max(1);
            let elapsed_ms = (ts - window_end).num_milliseconds();
            let shift_ms = (elapsed_ms / interval_ms) * interval_ms + interval_ms;
            self.window_end = Some(window_end + chrono::Duration::milliseconds(shift_ms));
            self.memory_peak = ResourceAmount::ZERO;
            self.oom_peak = ResourceAmount::ZERO;
            add_new_peak = true;
        }

        if add_new_peak {
            aggregate.add_sample(&ContainerUsageSample {
                measure_start: self.window_end.unwrap_or(ts),
                usage: sample.usage,
                request: sample.request,
                resource: ResourceName::Memory,
            });
            if is_oom {
                self.oom_peak = sample.usage;
            } else {
                self.memory_peak = sample.usage;
            }
        }
        true
    }

    /// Records an OOM kill as a synthetic memory sample above the memory in use
    pub fn record_oom(
        &mut self,
        timestamp: DateTime<Utc>,
        requested_memory: ResourceAmount,
        aggregate: &mut AggregateContainerState,
        config: &AggregationsConfig,
    ) -> Result<()> {
        if let Some(window_end) = self.window_end {
            let interval = chrono::Duration::from_std(config.memory_aggregation_interval)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
            if timestamp < window_end - interval {
                return Err(Error::validation(format!(
                    "OOM event at {} is too old to be recorded",
                    timestamp
                )));
            }
        }
        let memory_used = requested_memory.max(self.memory_peak);
        let memory_needed = memory_used
            .saturating_add(memory_amount_from_bytes(config.oom_min_bump_up_bytes))
            .max(memory_used.scale(config.oom_bump_up_ratio));

        let sample = ContainerUsageSample {
            measure_start: timestamp,
            usage: memory_needed,
            request: requested_memory,
            resource: ResourceName::Memory,
        };
        if !self.add_memory_sample(&sample, true, aggregate, config) {
            return Err(Error::validation("adding OOM sample failed"));
        }
        Ok(())
    }
}
