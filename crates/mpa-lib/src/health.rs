//! Liveness and readiness of the control loops
//!
//! Every long-running loop (recommender, updater, lease refresher, webhook)
//! reports the outcome of each tick here. A loop that keeps failing turns
//! the process unhealthy so the kubelet restarts it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;

/// Consecutive failed ticks after which a loop counts as unhealthy
pub const UNHEALTHY_AFTER_FAILURES: u32 = 5;

/// Names of the loops reporting to the registry
pub mod loops {
    pub const RECOMMENDER: &str = "recommender";
    pub const UPDATER: &str = "updater";
    pub const ADMISSION_CONTROLLER: &str = "admission_controller";
    pub const LEASE: &str = "lease";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStatus {
    Healthy,
    /// The last tick failed; the loop retries on its next interval
    Degraded,
    Unhealthy,
}

/// Tick history of one loop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopHealth {
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    /// Set when the loop stopped for good, e.g. the webhook lost its listener
    #[serde(default)]
    pub stopped: bool,
}

impl LoopHealth {
    pub fn status(&self) -> LoopStatus {
        if self.stopped || self.consecutive_failures >= UNHEALTHY_AFTER_FAILURES {
            LoopStatus::Unhealthy
        } else if self.consecutive_failures > 0 {
            LoopStatus::Degraded
        } else {
            LoopStatus::Healthy
        }
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: LoopStatus,
    pub loops: BTreeMap<String, LoopHealth>,
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Readiness {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    loops: BTreeMap<String, LoopHealth>,
    ready: bool,
}

/// Shared view of loop health, cloned into every loop and the HTTP server
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<State>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: &str) {
        self.state
            .write()
            .await
            .loops
            .entry(name.to_string())
            .or_default();
    }

    /// Records the outcome of one tick of loop `name`
    pub async fn record_tick<T>(&self, name: &str, outcome: &Result<T>) {
        let mut state = self.state.write().await;
        let entry = state.loops.entry(name.to_string()).or_default();
        match outcome {
            Ok(_) => {
                entry.consecutive_failures = 0;
                entry.last_error = None;
                entry.last_success = Some(Utc::now());
            }
            Err(e) => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                entry.last_error = Some(e.to_string());
            }
        }
    }

    /// Marks loop `name` as stopped with `reason`
    pub async fn set_unhealthy(&self, name: &str, reason: impl Into<String>) {
        let mut state = self.state.write().await;
        let entry = state.loops.entry(name.to_string()).or_default();
        entry.stopped = true;
        entry.last_error = Some(reason.into());
    }

    /// Flipped on once the informer caches are synced, off on shutdown
    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    pub async fn health(&self) -> HealthReport {
        let state = self.state.read().await;
        let status = state
            .loops
            .values()
            .map(LoopHealth::status)
            .fold(LoopStatus::Healthy, |worst, s| match (worst, s) {
                (LoopStatus::Unhealthy, _) | (_, LoopStatus::Unhealthy) => LoopStatus::Unhealthy,
                (LoopStatus::Degraded, _) | (_, LoopStatus::Degraded) => LoopStatus::Degraded,
                _ => LoopStatus::Healthy,
            });
        HealthReport {
            status,
            loops: state.loops.clone(),
        }
    }

    pub async fn readiness(&self) -> Readiness {
        let state = self.state.read().await;
        if !state.ready {
            return Readiness {
                ready: false,
                reason: Some("caches not synced".to_string()),
            };
        }
        let unhealthy = state
            .loops
            .iter()
            .find(|(_, health)| health.status() == LoopStatus::Unhealthy);
        match unhealthy {
            Some((name, _)) => Readiness {
                ready: false,
                reason: Some(format!("{} loop is unhealthy", name)),
            },
            None => Readiness {
                ready: true,
                reason: None,
            },
        }
    }
}
