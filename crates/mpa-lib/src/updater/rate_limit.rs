//! Token bucket limiting evictions across all MPAs

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

struct Bucket {
    /// Tokens added per second
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last = now;
    }

    /// Takes one token and returns how long the caller has to wait for it
    fn reserve(&mut self, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

/// Eviction rate limiter. A rate of zero or less disables limiting.
pub struct EvictionRateLimiter {
    bucket: Option<Mutex<Bucket>>,
}

impl EvictionRateLimiter {
    /// `rate` evictions per second with up to `burst` at once. A burst below
    /// one is raised to one.
    pub fn new(rate: f64, burst: u32) -> Self {
        if rate <= 0.0 {
            info!("Eviction rate limit disabled");
            return Self::unlimited();
        }
        let burst = f64::from(burst.max(1));
        Self {
            bucket: Some(Mutex::new(Bucket {
                rate,
                burst,
                tokens: burst,
                last: Instant::now(),
            })),
        }
    }

    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    pub fn is_limited(&self) -> bool {
        self.bucket.is_some()
    }

    /// Reserves the next token and returns the wait it requires
    pub async fn reserve(&self) -> Duration {
        match &self.bucket {
            Some(bucket) => bucket.lock().await.reserve(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Waits until an eviction is allowed
    pub async fn wait(&self) {
        let delay = self.reserve().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
