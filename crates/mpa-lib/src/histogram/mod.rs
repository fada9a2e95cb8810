//! Usage histograms for the recommender
//!
//! This module provides:
//! - Bucket layouts (linear and exponential)
//! - A plain weighted histogram with percentile queries
//! - A decaying histogram where sample weight halves every half-life
//! - A compact checkpoint format for persisting either

#[allow(clippy::module_inception)]
mod histogram;
mod decaying;
mod options;

#[cfg(test)]
mod tests;

pub use decaying::{DecayingHistogram, MAX_DECAY_EXPONENT};
pub use histogram::Histogram;
pub use options::HistogramOptions;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Weight given to the heaviest bucket when a histogram is checkpointed
pub const MAX_CHECKPOINT_WEIGHT: u32 = 10_000;

/// Serialized form of a histogram
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HistogramCheckpoint {
    /// Decay reference of the weights below
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_timestamp: Option<DateTime<Utc>>,
    /// Bucket index to integer weight, scaled so the maximum is 10000
    #[serde(default)]
    pub bucket_weights: BTreeMap<u32, u32>,
    /// Sum of the real bucket weights
    #[serde(default)]
    pub total_weight: f64,
}
