use crate::model::AggregateContainerState;
use crate::models::{
    cpu_amount_from_cores, memory_amount_from_bytes, ResourceAmount, ResourceName, Resources,
};

/// Largest amount an estimator returns. Keeps infinite multipliers finite.
pub const MAX_RESOURCE_AMOUNT: ResourceAmount = ResourceAmount(100_000_000_000_000);

/// Samples per day at one sample a minute
const SAMPLES_PER_DAY: f64 = 60.0 * 24.0;

/// Computes a resource estimate from an aggregated usage history
pub trait ResourceEstimator: Send + Sync {
    fn estimate(&self, state: &AggregateContainerState) -> Resources;
}

fn capped(amount: f64) -> ResourceAmount {
    if amount.is_nan() || amount <= 0.0 {
        return ResourceAmount::ZERO;
    }
    if amount >= MAX_RESOURCE_AMOUNT.0 as f64 {
        return MAX_RESOURCE_AMOUNT;
    }
    ResourceAmount::from_f64(amount)
}

/// Percentile of the CPU usage and memory peak histograms
#[derive(Debug, Clone, Copy)]
pub struct PercentileEstimator {
    pub cpu_percentile: f64,
    pub memory_percentile: f64,
}

impl PercentileEstimator {
    pub fn new(cpu_percentile: f64, memory_percentile: f64) -> Self {
        Self {
            cpu_percentile,
            memory_percentile,
        }
    }
}

impl ResourceEstimator for PercentileEstimator {
    fn estimate(&self, state: &AggregateContainerState) -> Resources {
        Resources::from([
            (
                ResourceName::Cpu,
                cpu_amount_from_cores(state.cpu_usage.percentile(self.cpu_percentile)),
            ),
            (
                ResourceName::Memory,
                memory_amount_from_bytes(state.memory_peaks.percentile(self.memory_percentile)),
            ),
        ])
    }
}

/// Adds `fraction` of the base estimate, and at least `min_margin`
pub struct MarginEstimator {
    fraction: f64,
    min_margin: Resources,
    base: Box<dyn ResourceEstimator>,
}

impl MarginEstimator {
    pub fn new(fraction: f64, base: Box<dyn ResourceEstimator>) -> Self {
        Self {
            fraction,
            min_margin: Resources::new(),
            base,
        }
    }

    pub fn with_min_margin(mut self, min_margin: Resources) -> Self {
        self.min_margin = min_margin;
        self
    }
}

impl ResourceEstimator for MarginEstimator {
    fn estimate(&self, state: &AggregateContainerState) -> Resources {
        self.base
            .estimate(state)
            .into_iter()
            .map(|(resource, amount)| {
                let margin = capped(amount.0 as f64 * self.fraction)
                    .max(self.min_margin.get(&resource).copied().unwrap_or_default());
                (resource, capped(amount.0 as f64 + margin.0 as f64))
            })
            .collect()
    }
}

/// Confidence in a history: the smaller of its length in days and its
/// sample count in days of one-per-minute samples
pub fn confidence(state: &AggregateContainerState) -> f64 {
    let samples_in_days = state.total_samples_count as f64 / SAMPLES_PER_DAY;
    state.lifespan_days().min(samples_in_days)
}

/// Scales the base estimate by `(1 + multiplier / confidence) ^ exponent`.
///
/// Without history the factor is 0 for negative exponents and the estimate
/// saturates at [`MAX_RESOURCE_AMOUNT`] for positive ones.
pub struct ConfidenceMultiplier {
    multiplier: f64,
    exponent: f64,
    base: Box<dyn ResourceEstimator>,
}

impl ConfidenceMultiplier {
    pub fn new(multiplier: f64, exponent: f64, base: Box<dyn ResourceEstimator>) -> Self {
        Self {
            multiplier,
            exponent,
            base,
        }
    }

    pub fn factor(&self, confidence: f64) -> f64 {
        (1.0 + self.multiplier / confidence).powf(self.exponent)
    }
}

impl ResourceEstimator for ConfidenceMultiplier {
    fn estimate(&self, state: &AggregateContainerState) -> Resources {
        let factor = self.factor(confidence(state));
        self.base
            .estimate(state)
            .into_iter()
            .map(|(resource, amount)| {
                let scaled = if amount.0 == 0 {
                    ResourceAmount::ZERO
                } else {
                    capped(amount.0 as f64 * factor)
                };
                (resource, scaled)
            })
            .collect()
    }
}

/// Raises every resource of the base estimate to at least `min`
pub struct MinResourcesEstimator<'a> {
    min: &'a Resources,
    base: &'a dyn ResourceEstimator,
}

impl<'a> MinResourcesEstimator<'a> {
    pub fn new(min: &'a Resources, base: &'a dyn ResourceEstimator) -> Self {
        Self { min, base }
    }
}

impl ResourceEstimator for MinResourcesEstimator<'_> {
    fn estimate(&self, state: &AggregateContainerState) -> Resources {
        self.base
            .estimate(state)
            .into_iter()
            .map(|(resource, amount)| {
                let floor = self.min.get(&resource).copied().unwrap_or_default();
                (resource, amount.max(floor))
            })
            .collect()
    }
}
