use std::collections::BTreeMap;

use super::{HistogramCheckpoint, HistogramOptions, MAX_CHECKPOINT_WEIGHT};
use crate::error::{Error, Result};

/// Weighted histogram over a fixed bucket layout.
///
/// Tracks the lowest and highest non-empty bucket so that percentile queries
/// and merges only touch the populated range. An empty histogram keeps
/// `min_bucket = num_buckets - 1` and `max_bucket = 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    options: HistogramOptions,
    bucket_weight: Vec<f64>,
    total_weight: f64,
    min_bucket: usize,
    max_bucket: usize,
}

impl Histogram {
    pub fn new(options: HistogramOptions) -> Self {
        let num_buckets = options.num_buckets();
        Self {
            options,
            bucket_weight: vec![0.0; num_buckets],
            total_weight: 0.0,
            min_bucket: num_buckets - 1,
            max_bucket: 0,
        }
    }

    pub fn options(&self) -> &HistogramOptions {
        &self.options
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Weight of a single bucket
    pub fn bucket_weight(&self, bucket: usize) -> f64 {
        self.bucket_weight.get(bucket).copied().unwrap_or(0.0)
    }

    /// Add `weight` to the bucket holding `value`. Negative weights are ignored.
    pub fn add_sample(&mut self, value: f64, weight: f64) {
        if weight.is_nan() || weight < 0.0 {
            return;
        }
        let bucket = self.options.find_bucket(value);
        self.bucket_weight[bucket] += weight;
        self.total_weight += weight;
        if bucket < self.min_bucket && self.bucket_weight[bucket] >= self.options.epsilon() {
            self.min_bucket = bucket;
        }
        if bucket > self.max_bucket && self.bucket_weight[bucket] >= self.options.epsilon() {
            self.max_bucket = bucket;
        }
    }

    /// Remove up to `weight` from the bucket holding `value`. A bucket that
    /// drops below epsilon is cleared and the populated range re-scanned.
    pub fn subtract_sample(&mut self, value: f64, weight: f64) {
        if weight.is_nan() || weight < 0.0 {
            return;
        }
        let bucket = self.options.find_bucket(value);
        let weight = weight.min(self.bucket_weight[bucket]);
        self.bucket_weight[bucket] -= weight;
        self.total_weight -= weight;
        if self.bucket_weight[bucket] < self.options.epsilon() {
            self.total_weight -= self.bucket_weight[bucket];
            self.bucket_weight[bucket] = 0.0;
            if self.total_weight < 0.0 {
                self.total_weight = 0.0;
            }
            self.update_min_and_max_bucket();
        }
    }

    /// Smallest bucket start such that the cumulative weight up to and
    /// including that bucket reaches `percentile * total_weight`.
    ///
    /// Returns 0 for an empty histogram. Percentiles below 0 resolve to the
    /// lowest populated bucket and above 1 to the highest.
    pub fn percentile(&self, percentile: f64) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let threshold = percentile * self.total_weight;
        let mut partial_sum = 0.0;
        let mut bucket = self.min_bucket;
        loop {
            partial_sum += self.bucket_weight[bucket];
            if partial_sum >= threshold || bucket >= self.max_bucket {
                break;
            }
            bucket += 1;
        }
        self.options.bucket_start(bucket)
    }

    pub fn is_empty(&self) -> bool {
        self.bucket_weight[self.min_bucket] < self.options.epsilon()
    }

    /// Add all weights of `other` into this histogram
    pub fn merge(&mut self, other: &Histogram) -> Result<()> {
        if self.options != other.options {
            return Err(Error::histogram(
                "cannot merge histograms with different bucket layouts",
            ));
        }
        if other.is_empty() {
            return Ok(());
        }
        for bucket in other.min_bucket..=other.max_bucket {
            self.bucket_weight[bucket] += other.bucket_weight[bucket];
        }
        self.total_weight += other.total_weight;
        self.update_min_and_max_bucket();
        Ok(())
    }

    /// Multiply every weight by a non-negative factor
    pub fn scale(&mut self, factor: f64) {
        if factor.is_nan() || factor < 0.0 {
            return;
        }
        for weight in self.bucket_weight.iter_mut() {
            *weight *= factor;
        }
        self.total_weight *= factor;
        self.update_min_and_max_bucket();
    }

    fn update_min_and_max_bucket(&mut self) {
        let epsilon = self.options.epsilon();
        let last = self.options.num_buckets() - 1;
        let first_populated = self.bucket_weight.iter().position(|w| *w >= epsilon);
        match first_populated {
            Some(min) => {
                self.min_bucket = min;
                self.max_bucket = self
                    .bucket_weight
                    .iter()
                    .rposition(|w| *w >= epsilon)
                    .unwrap_or(min);
            }
            None => {
                self.min_bucket = last;
                self.max_bucket = 0;
            }
        }
    }

    /// Serialize to integer weights scaled so that the heaviest bucket gets
    /// [`MAX_CHECKPOINT_WEIGHT`]; the true total weight is kept separately.
    pub fn save_to_checkpoint(&self) -> HistogramCheckpoint {
        let mut bucket_weights = BTreeMap::new();
        if !self.is_empty() {
            let max_weight = self.bucket_weight[self.min_bucket..=self.max_bucket]
                .iter()
                .cloned()
                .fold(0.0_f64, f64::max);
            let ratio = MAX_CHECKPOINT_WEIGHT as f64 / max_weight;
            for bucket in self.min_bucket..=self.max_bucket {
                let weight = (self.bucket_weight[bucket] * ratio).round();
                if weight > 0.0 {
                    bucket_weights.insert(bucket as u32, weight as u32);
                }
            }
        }
        HistogramCheckpoint {
            reference_timestamp: None,
            bucket_weights,
            total_weight: self.total_weight,
        }
    }

    /// Add the weights stored in a checkpoint, rescaled to its total weight
    pub fn load_from_checkpoint(&mut self, checkpoint: &HistogramCheckpoint) -> Result<()> {
        if checkpoint.total_weight.is_nan() || checkpoint.total_weight < 0.0 {
            return Err(Error::checkpoint(format!(
                "invalid total weight {}",
                checkpoint.total_weight
            )));
        }
        let num_buckets = self.options.num_buckets();
        let mut sum = 0u64;
        for (&bucket, &weight) in &checkpoint.bucket_weights {
            if bucket as usize >= num_buckets {
                return Err(Error::checkpoint(format!(
                    "bucket {} outside of histogram with {} buckets",
                    bucket, num_buckets
                )));
            }
            sum += weight as u64;
        }
        if sum == 0 {
            return Ok(());
        }
        let ratio = checkpoint.total_weight / sum as f64;
        for (&bucket, &weight) in &checkpoint.bucket_weights {
            self.bucket_weight[bucket as usize] += weight as f64 * ratio;
        }
        self.total_weight += checkpoint.total_weight;
        self.update_min_and_max_bucket();
        Ok(())
    }

    /// Approximate equality used by tests and checkpoint comparisons
    pub fn approx_eq(&self, other: &Histogram, tolerance: f64) -> bool {
        if self.options != other.options {
            return false;
        }
        if self.is_empty() && other.is_empty() {
            return true;
        }
        if (self.total_weight - other.total_weight).abs() > tolerance * self.total_weight.max(1.0)
        {
            return false;
        }
        self.bucket_weight
            .iter()
            .zip(other.bucket_weight.iter())
            .all(|(a, b)| (a - b).abs() <= tolerance * a.abs().max(b.abs()).max(1.0))
    }
}
