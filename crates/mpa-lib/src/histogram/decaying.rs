use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

use super::{Histogram, HistogramCheckpoint, HistogramOptions};
use crate::error::{Error, Result};

/// Renormalize once a sample would be weighted by more than `2^100`
pub const MAX_DECAY_EXPONENT: f64 = 100.0;

/// Histogram whose sample weights halve every `half_life`.
///
/// Instead of decaying old samples, new samples are weighted up by
/// `2^((t - reference) / half_life)`. When that exponent would exceed
/// [`MAX_DECAY_EXPONENT`] the reference moves forward and all stored weights
/// are scaled down accordingly.
#[derive(Debug, Clone, PartialEq)]
pub struct DecayingHistogram {
    histogram: Histogram,
    half_life: Duration,
    reference_timestamp: Option<DateTime<Utc>>,
}

impl DecayingHistogram {
    pub fn new(options: HistogramOptions, half_life: Duration) -> Self {
        Self {
            histogram: Histogram::new(options),
            half_life,
            reference_timestamp: None,
        }
    }

    pub fn half_life(&self) -> Duration {
        self.half_life
    }

    pub fn reference_timestamp(&self) -> Option<DateTime<Utc>> {
        self.reference_timestamp
    }

    /// Underlying weights, expressed relative to the reference timestamp
    pub fn histogram(&self) -> &Histogram {
        &self.histogram
    }

    pub fn add_sample(&mut self, value: f64, weight: f64, time: DateTime<Utc>) {
        let factor = self.decay_factor(time);
        self.histogram.add_sample(value, weight * factor);
    }

    pub fn subtract_sample(&mut self, value: f64, weight: f64, time: DateTime<Utc>) {
        let factor = self.decay_factor(time);
        self.histogram.subtract_sample(value, weight * factor);
    }

    pub fn percentile(&self, percentile: f64) -> f64 {
        self.histogram.percentile(percentile)
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    pub fn total_weight(&self) -> f64 {
        self.histogram.total_weight()
    }

    /// Merge `other` into this histogram. Both must share the half-life; the
    /// one with the older reference is shifted to the newer one first.
    pub fn merge(&mut self, other: &DecayingHistogram) -> Result<()> {
        if self.half_life != other.half_life {
            return Err(Error::histogram(format!(
                "cannot merge decaying histograms with different half-lives ({:?} vs {:?})",
                self.half_life, other.half_life
            )));
        }
        let mut other = other.clone();
        match (self.reference_timestamp, other.reference_timestamp) {
            (Some(mine), Some(theirs)) if mine < theirs => self.shift_reference_timestamp(theirs),
            (Some(mine), Some(theirs)) if theirs < mine => other.shift_reference_timestamp(mine),
            (None, Some(theirs)) => self.reference_timestamp = Some(theirs),
            _ => {}
        }
        self.histogram.merge(&other.histogram)
    }

    pub fn save_to_checkpoint(&self) -> HistogramCheckpoint {
        let mut checkpoint = self.histogram.save_to_checkpoint();
        checkpoint.reference_timestamp = self.reference_timestamp;
        checkpoint
    }

    pub fn load_from_checkpoint(&mut self, checkpoint: &HistogramCheckpoint) -> Result<()> {
        self.histogram.load_from_checkpoint(checkpoint)?;
        self.reference_timestamp = checkpoint.reference_timestamp;
        Ok(())
    }

    fn half_life_secs(&self) -> f64 {
        self.half_life.as_secs_f64()
    }

    fn decay_factor(&mut self, time: DateTime<Utc>) -> f64 {
        let needs_shift = match self.reference_timestamp {
            None => true,
            Some(reference) => {
                let exponent = seconds_between(reference, time) / self.half_life_secs();
                exponent > MAX_DECAY_EXPONENT
            }
        };
        if needs_shift {
            self.shift_reference_timestamp(time);
        }
        let reference = self.reference_timestamp.unwrap_or(time);
        (seconds_between(reference, time) / self.half_life_secs()).exp2()
    }

    /// Move the reference to `new_reference` rounded to a whole number of
    /// half-lives, rescaling stored weights to keep them consistent.
    fn shift_reference_timestamp(&mut self, new_reference: DateTime<Utc>) {
        let new_reference = round_to_multiple(new_reference, self.half_life);
        if let Some(old) = self.reference_timestamp {
            let exponent = seconds_between(new_reference, old) / self.half_life_secs();
            self.histogram.scale(exponent.exp2());
        }
        self.reference_timestamp = Some(new_reference);
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

fn round_to_multiple(time: DateTime<Utc>, step: Duration) -> DateTime<Utc> {
    let step_ms = step.as_millis() as i64;
    if step_ms <= 0 {
        return time;
    }
    let ms = time.timestamp_millis();
    let rounded = ((ms as f64 / step_ms as f64).round() as i64) * step_ms;
    Utc.timestamp_millis_opt(rounded).single().unwrap_or(time)
}
