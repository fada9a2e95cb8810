//! Admission controller liveness lease
//!
//! The admission controller renews a `coordination.k8s.io` Lease on a fixed
//! period. The updater only evicts pods while the lease is fresh.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::LeaseClient;
use crate::error::Result;
use crate::health::{loops, HealthRegistry};

pub const ADMISSION_CONTROLLER_LEASE: &str = "mpa-admission-controller";
pub const DEFAULT_LEASE_NAMESPACE: &str = "kube-system";
pub const LEASE_DURATION_SECS: i32 = 60;
pub const RENEW_INTERVAL: Duration = Duration::from_secs(10);

/// Namespace of the lease: `$NAMESPACE` when set, else `kube-system`
pub fn lease_namespace() -> String {
    std::env::var("NAMESPACE")
        .ok()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| DEFAULT_LEASE_NAMESPACE.to_string())
}

/// Keeps the admission controller lease renewed
pub struct LeaseRefresher {
    client: Arc<dyn LeaseClient>,
    namespace: String,
    name: String,
    holder: String,
    renew_interval: Duration,
}

impl LeaseRefresher {
    pub fn new(client: Arc<dyn LeaseClient>, namespace: impl Into<String>, holder: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: ADMISSION_CONTROLLER_LEASE.to_string(),
            holder: holder.into(),
            renew_interval: RENEW_INTERVAL,
        }
    }

    /// Renews the lease with `now` as renew time. The acquire time is kept
    /// while the holder stays the same.
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<()> {
        let existing = self.client.get_lease(&self.namespace, &self.name).await?;
        let acquire_time = existing
            .as_ref()
            .and_then(|l| l.spec.as_ref())
            .filter(|s| s.holder_identity.as_deref() == Some(self.holder.as_str()))
            .and_then(|s| s.acquire_time.clone())
            .unwrap_or(MicroTime(now));

        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.holder.clone()),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                acquire_time: Some(acquire_time),
                renew_time: Some(MicroTime(now)),
                ..Default::default()
            }),
        };
        self.client.apply_lease(&lease).await?;
        debug!(lease = %self.name, namespace = %self.namespace, "Renewed lease");
        Ok(())
    }

    pub async fn run(self, health: HealthRegistry, mut shutdown: broadcast::Receiver<()>) {
        info!(
            lease = %self.name,
            namespace = %self.namespace,
            holder = %self.holder,
            "Starting lease refresher"
        );
        health.register(loops::LEASE).await;
        let mut ticker = interval(self.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.refresh(Utc::now()).await;
                    if let Err(e) = &outcome {
                        warn!(lease = %self.name, error = %e, "Failed to renew lease");
                    }
                    health.record_tick(loops::LEASE, &outcome).await;
                }
                _ = shutdown.recv() => {
                    info!("Lease refresher shutting down");
                    break;
                }
            }
        }
    }
}

/// Reads the admission controller lease on behalf of the updater
pub struct LeaseChecker {
    client: Arc<dyn LeaseClient>,
    namespace: String,
    name: String,
    timeout: chrono::Duration,
}

impl LeaseChecker {
    pub fn new(client: Arc<dyn LeaseClient>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: ADMISSION_CONTROLLER_LEASE.to_string(),
            timeout: chrono::Duration::seconds(LEASE_DURATION_SECS as i64),
        }
    }

    pub fn with_timeout(mut self, timeout: chrono::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// True when the lease exists and was renewed within the timeout
    pub async fn is_fresh(&self, now: DateTime<Utc>) -> Result<bool> {
        let Some(lease) = self.client.get_lease(&self.namespace, &self.name).await? else {
            return Ok(false);
        };
        let renewed = lease
            .spec
            .as_ref()
            .and_then(|s| s.renew_time.as_ref())
            .map(|t| t.0);
        Ok(renewed.map_or(false, |t| now - t <= self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeCluster;

    fn t0() -> DateTime<Utc> {
        crate::testutil::t0()
    }

    #[tokio::test]
    async fn test_refresh_creates_and_renews() {
        let cluster = Arc::new(FakeCluster::new());
        let refresher = LeaseRefresher::new(cluster.clone(), "mpa-system", "admission-0");

        refresher.refresh(t0()).await.unwrap();
        refresher
            .refresh(t0() + chrono::Duration::seconds(10))
            .await
            .unwrap();

        let lease = cluster
            .get_lease("mpa-system", ADMISSION_CONTROLLER_LEASE)
            .await
            .unwrap()
            .unwrap();
        let spec = lease.spec.unwrap();
        assert_eq!(spec.holder_identity.as_deref(), Some("admission-0"));
        assert_eq!(spec.lease_duration_seconds, Some(LEASE_DURATION_SECS));
        assert_eq!(spec.acquire_time, Some(MicroTime(t0())));
        assert_eq!(
            spec.renew_time,
            Some(MicroTime(t0() + chrono::Duration::seconds(10)))
        );
    }

    #[tokio::test]
    async fn test_new_holder_resets_acquire_time() {
        let cluster = Arc::new(FakeCluster::new());
        LeaseRefresher::new(cluster.clone(), "mpa-system", "admission-0")
            .refresh(t0())
            .await
            .unwrap();
        let later = t0() + chrono::Duration::minutes(5);
        LeaseRefresher::new(cluster.clone(), "mpa-system", "admission-1")
            .refresh(later)
            .await
            .unwrap();

        let lease = cluster
            .get_lease("mpa-system", ADMISSION_CONTROLLER_LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.spec.unwrap().acquire_time, Some(MicroTime(later)));
    }

    #[tokio::test]
    async fn test_checker_freshness() {
        let cluster = Arc::new(FakeCluster::new());
        let checker = LeaseChecker::new(cluster.clone(), "mpa-system");
        assert!(!checker.is_fresh(t0()).await.unwrap());

        LeaseRefresher::new(cluster.clone(), "mpa-system", "admission-0")
            .refresh(t0())
            .await
            .unwrap();
        assert!(checker
            .is_fresh(t0() + chrono::Duration::seconds(30))
            .await
            .unwrap());
        assert!(!checker
            .is_fresh(t0() + chrono::Duration::seconds(61))
            .await
            .unwrap());

        let strict = LeaseChecker::new(cluster.clone(), "mpa-system")
            .with_timeout(chrono::Duration::seconds(5));
        assert!(!strict
            .is_fresh(t0() + chrono::Duration::seconds(30))
            .await
            .unwrap());
    }
}
