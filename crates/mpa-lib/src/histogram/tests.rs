//! Tests for histograms and their checkpoints

use super::*;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

fn linear() -> HistogramOptions {
    HistogramOptions::linear(10.0, 1.0, 1e-4).unwrap()
}

fn exponential() -> HistogramOptions {
    HistogramOptions::exponential(1000.0, 0.01, 1.05, 1e-4).unwrap()
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

#[test]
fn test_empty_histogram() {
    let h = Histogram::new(linear());
    assert!(h.is_empty());
    assert_eq!(h.percentile(0.0), 0.0);
    assert_eq!(h.percentile(0.5), 0.0);
    assert_eq!(h.percentile(1.0), 0.0);
}

#[test]
fn test_percentiles() {
    let mut h = Histogram::new(linear());
    for i in 1..=4 {
        h.add_sample(i as f64, 1.0);
    }
    assert_eq!(h.percentile(0.25), 1.0);
    assert_eq!(h.percentile(0.5), 2.0);
    assert_eq!(h.percentile(0.75), 3.0);
    assert_eq!(h.percentile(1.0), 4.0);
}

#[test]
fn test_percentile_out_of_range() {
    let mut h = Histogram::new(linear());
    h.add_sample(3.0, 1.0);
    h.add_sample(7.0, 1.0);
    assert_eq!(h.percentile(-1.0), 3.0);
    assert_eq!(h.percentile(2.0), 7.0);
}

#[test]
fn test_percentile_is_monotonic() {
    let mut h = Histogram::new(exponential());
    for (i, v) in [0.05, 0.2, 0.2, 1.5, 3.0, 0.7, 12.0].iter().enumerate() {
        h.add_sample(*v, 1.0 + i as f64);
    }
    let mut last = h.percentile(0.0);
    for step in 1..=100 {
        let p = h.percentile(step as f64 / 100.0);
        assert!(p >= last);
        last = p;
    }
    assert!(h.percentile(0.0) <= h.percentile(1.0));
}

#[test]
fn test_subtract_sample_clears_bucket() {
    let mut h = Histogram::new(linear());
    h.add_sample(1.0, 1.0);
    h.add_sample(5.0, 2.0);
    h.subtract_sample(5.0, 2.0);
    assert_eq!(h.percentile(1.0), 1.0);
    assert!((h.total_weight() - 1.0).abs() < 1e-9);

    h.subtract_sample(1.0, 5.0);
    assert!(h.is_empty());
    assert_eq!(h.total_weight(), 0.0);
}

#[test]
fn test_negative_weight_ignored() {
    let mut h = Histogram::new(linear());
    h.add_sample(1.0, -1.0);
    assert!(h.is_empty());
}

#[test]
fn test_merge_sums_weights() {
    let mut a = Histogram::new(linear());
    a.add_sample(1.0, 1.0);
    let mut b = Histogram::new(linear());
    b.add_sample(9.0, 3.0);
    a.merge(&b).unwrap();
    assert_eq!(a.total_weight(), 4.0);
    assert_eq!(a.percentile(0.2), 1.0);
    assert_eq!(a.percentile(0.5), 9.0);
}

#[test]
fn test_merge_empty_histograms() {
    let mut a = Histogram::new(linear());
    let b = Histogram::new(linear());
    a.merge(&b).unwrap();
    assert!(a.is_empty());
}

#[test]
fn test_merge_rejects_different_layouts() {
    let mut a = Histogram::new(linear());
    let b = Histogram::new(exponential());
    assert!(a.merge(&b).is_err());
}

#[test]
fn test_checkpoint_roundtrip_preserves_percentiles() {
    let mut h = Histogram::new(exponential());
    h.add_sample(0.1, 10.0);
    h.add_sample(0.5, 3.5);
    h.add_sample(2.0, 0.25);

    let checkpoint = h.save_to_checkpoint();
    assert_eq!(checkpoint.bucket_weights.values().max(), Some(&MAX_CHECKPOINT_WEIGHT));

    let mut restored = Histogram::new(exponential());
    restored.load_from_checkpoint(&checkpoint).unwrap();
    assert!(restored.approx_eq(&h, 1e-3));
    for p in [0.1, 0.5, 0.9, 0.95] {
        assert_eq!(restored.percentile(p), h.percentile(p));
    }
}

#[test]
fn test_checkpoint_rejects_out_of_range_bucket() {
    let mut checkpoint = HistogramCheckpoint {
        total_weight: 1.0,
        ..Default::default()
    };
    checkpoint.bucket_weights.insert(1_000_000, 1);
    let mut h = Histogram::new(linear());
    assert!(h.load_from_checkpoint(&checkpoint).is_err());
}

#[test]
fn test_checkpoint_serializes_bucket_keys_as_strings() {
    let mut h = Histogram::new(linear());
    h.add_sample(2.0, 1.0);
    let json = serde_json::to_value(h.save_to_checkpoint()).unwrap();
    assert_eq!(json["bucketWeights"]["2"], 10000);
    assert_eq!(json["totalWeight"], 1.0);
}

#[test]
fn test_decaying_weights_halve_per_half_life() {
    let mut h = DecayingHistogram::new(linear(), HOUR);
    let t0 = start();
    h.add_sample(2.0, 1.0, t0);
    h.add_sample(1.0, 1.0, t0 + ChronoDuration::hours(1));
    // the newer sample weighs twice as much
    assert_eq!(h.percentile(0.34), 1.0);
    assert_eq!(h.percentile(0.66), 1.0);
    assert_eq!(h.percentile(0.7), 2.0);
}

#[test]
fn test_decaying_renormalizes_far_future_samples() {
    let mut h = DecayingHistogram::new(linear(), HOUR);
    let t0 = start();
    h.add_sample(2.0, 1.0, t0);
    let later = t0 + ChronoDuration::hours(150);
    h.add_sample(5.0, 1.0, later);

    assert!(h.total_weight().is_finite());
    assert!(h.reference_timestamp().unwrap() > t0);
    // the old sample is negligible after 150 half-lives
    assert_eq!(h.percentile(0.01), 5.0);
}

#[test]
fn test_decaying_merge_is_commutative() {
    let t0 = start();
    let mut a = DecayingHistogram::new(exponential(), HOUR);
    a.add_sample(0.3, 1.0, t0);
    let mut b = DecayingHistogram::new(exponential(), HOUR);
    b.add_sample(1.2, 1.0, t0 + ChronoDuration::hours(200));

    let mut ab = a.clone();
    ab.merge(&b).unwrap();
    let mut ba = b.clone();
    ba.merge(&a).unwrap();

    assert_eq!(ab.reference_timestamp(), ba.reference_timestamp());
    assert!(ab.histogram().approx_eq(ba.histogram(), 1e-9));
}

#[test]
fn test_decaying_merge_is_associative() {
    let t0 = start();
    let mk = |value: f64, hours: i64| {
        let mut h = DecayingHistogram::new(exponential(), HOUR);
        h.add_sample(value, 1.0, t0 + ChronoDuration::hours(hours));
        h
    };
    let (a, b, c) = (mk(0.3, 0), mk(1.0, 3), mk(4.0, 7));

    let mut left = a.clone();
    left.merge(&b).unwrap();
    left.merge(&c).unwrap();

    let mut bc = b.clone();
    bc.merge(&c).unwrap();
    let mut right = a.clone();
    right.merge(&bc).unwrap();

    assert!(left.histogram().approx_eq(right.histogram(), 1e-9));
}

#[test]
fn test_decaying_merge_rejects_half_life_mismatch() {
    let mut a = DecayingHistogram::new(linear(), HOUR);
    let b = DecayingHistogram::new(linear(), HOUR * 2);
    assert!(a.merge(&b).is_err());
}

#[test]
fn test_decaying_checkpoint_roundtrip() {
    let t0 = start();
    let mut h = DecayingHistogram::new(exponential(), HOUR * 24);
    for i in 0..50 {
        h.add_sample(0.1 + i as f64 * 0.01, 1.0, t0 + ChronoDuration::minutes(i));
    }
    let checkpoint = h.save_to_checkpoint();
    assert_eq!(checkpoint.reference_timestamp, h.reference_timestamp());

    let mut restored = DecayingHistogram::new(exponential(), HOUR * 24);
    restored.load_from_checkpoint(&checkpoint).unwrap();
    assert_eq!(restored.reference_timestamp(), h.reference_timestamp());
    assert!(restored.histogram().approx_eq(h.histogram(), 1e-3));
    assert_eq!(restored.percentile(0.9), h.percentile(0.9));
}
