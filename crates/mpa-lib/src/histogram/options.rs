//! Bucket layouts for usage histograms

use crate::error::{Error, Result};

/// Layout of histogram buckets.
///
/// Bucket 0 always starts at 0. Values above the range land in the last
/// bucket and negative values in the first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HistogramOptions {
    /// Buckets of equal width
    Linear {
        bucket_size: f64,
        num_buckets: usize,
        epsilon: f64,
    },
    /// Bucket `n >= 1` covers `[first * ratio^(n-1), first * ratio^n)`
    Exponential {
        first_bucket_size: f64,
        ratio: f64,
        num_buckets: usize,
        epsilon: f64,
    },
}

impl HistogramOptions {
    /// Linear layout covering `[0, max_value]` in buckets of `bucket_size`
    pub fn linear(max_value: f64, bucket_size: f64, epsilon: f64) -> Result<Self> {
        if max_value <= 0.0 || bucket_size <= 0.0 || epsilon <= 0.0 {
            return Err(Error::histogram(
                "maxValue, bucketSize and epsilon must all be positive",
            ));
        }
        let num_buckets = (max_value / bucket_size).ceil() as usize + 1;
        Ok(HistogramOptions::Linear {
            bucket_size,
            num_buckets,
            epsilon,
        })
    }

    /// Exponential layout covering `[0, max_value]`
    pub fn exponential(
        max_value: f64,
        first_bucket_size: f64,
        ratio: f64,
        epsilon: f64,
    ) -> Result<Self> {
        if max_value <= 0.0 || first_bucket_size <= 0.0 || epsilon <= 0.0 {
            return Err(Error::histogram(
                "maxValue, firstBucketSize and epsilon must all be positive",
            ));
        }
        if ratio <= 1.0 {
            return Err(Error::histogram("ratio must be greater than 1"));
        }
        let num_buckets = if max_value <= first_bucket_size {
            2
        } else {
            ((max_value / first_bucket_size).ln() / ratio.ln()).ceil() as usize + 1
        };
        Ok(HistogramOptions::Exponential {
            first_bucket_size,
            ratio,
            num_buckets,
            epsilon,
        })
    }

    pub fn num_buckets(&self) -> usize {
        match self {
            HistogramOptions::Linear { num_buckets, .. } => *num_buckets,
            HistogramOptions::Exponential { num_buckets, .. } => *num_buckets,
        }
    }

    /// Weight below which a bucket counts as empty
    pub fn epsilon(&self) -> f64 {
        match self {
            HistogramOptions::Linear { epsilon, .. } => *epsilon,
            HistogramOptions::Exponential { epsilon, .. } => *epsilon,
        }
    }

    /// Index of the bucket holding `value`
    pub fn find_bucket(&self, value: f64) -> usize {
        let last = self.num_buckets() - 1;
        match *self {
            HistogramOptions::Linear { bucket_size, .. } => {
                if value.is_nan() || value < 0.0 {
                    return 0;
                }
                ((value / bucket_size).floor() as usize).min(last)
            }
            HistogramOptions::Exponential {
                first_bucket_size,
                ratio,
                ..
            } => {
                if value.is_nan() || value < first_bucket_size {
                    return 0;
                }
                let estimate = (value / first_bucket_size).ln() / ratio.ln();
                let mut bucket = (estimate.floor() as usize).saturating_add(1).min(last);
                // ln() can land a hair on either side of an exact boundary
                if bucket < last && self.bucket_start(bucket + 1) <= value {
                    bucket += 1;
                } else if bucket > 1 && self.bucket_start(bucket) > value {
                    bucket -= 1;
                }
                bucket
            }
        }
    }

    /// Lower bound of `bucket`
    pub fn bucket_start(&self, bucket: usize) -> f64 {
        match *self {
            HistogramOptions::Linear { bucket_size, .. } => bucket as f64 * bucket_size,
            HistogramOptions::Exponential {
                first_bucket_size,
                ratio,
                ..
            } => {
                if bucket == 0 {
                    0.0
                } else {
                    first_bucket_size * ratio.powi(bucket as i32 - 1)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_layout() {
        let o = HistogramOptions::linear(10.0, 1.0, 1e-4).unwrap();
        assert_eq!(o.num_buckets(), 11);
        assert_eq!(o.find_bucket(-1.0), 0);
        assert_eq!(o.find_bucket(0.5), 0);
        assert_eq!(o.find_bucket(3.0), 3);
        assert_eq!(o.find_bucket(100.0), 10);
        assert_eq!(o.bucket_start(4), 4.0);
    }

    #[test]
    fn test_exponential_layout() {
        let o = HistogramOptions::exponential(100.0, 10.0, 2.0, 1e-4).unwrap();
        // [0,10) [10,20) [20,40) [40,80) [80,160)
        assert_eq!(o.num_buckets(), 5);
        assert_eq!(o.find_bucket(5.0), 0);
        assert_eq!(o.find_bucket(10.0), 1);
        assert_eq!(o.find_bucket(19.9), 1);
        assert_eq!(o.find_bucket(20.0), 2);
        assert_eq!(o.find_bucket(79.0), 3);
        assert_eq!(o.find_bucket(1e9), 4);
        assert_eq!(o.bucket_start(0), 0.0);
        assert_eq!(o.bucket_start(1), 10.0);
        assert_eq!(o.bucket_start(3), 40.0);
    }

    #[test]
    fn test_exponential_boundaries_are_exact() {
        let o = HistogramOptions::exponential(1000.0, 0.01, 1.05, 1e-4).unwrap();
        for bucket in 1..o.num_buckets() {
            let start = o.bucket_start(bucket);
            assert_eq!(o.find_bucket(start), bucket, "bucket {}", bucket);
        }
    }

    #[test]
    fn test_invalid_options() {
        assert!(HistogramOptions::linear(0.0, 1.0, 1e-4).is_err());
        assert!(HistogramOptions::exponential(10.0, 1.0, 1.0, 1e-4).is_err());
        assert!(HistogramOptions::exponential(10.0, -1.0, 2.0, 1e-4).is_err());
    }
}
