use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::client::MpaClient;
use crate::crd::{MultidimPodAutoscalerCheckpoint, MultidimPodAutoscalerCheckpointSpec};
use crate::error::Result;
use crate::model::ClusterState;
use crate::models::MpaId;
use crate::retry::{retry_with_backoff, RetryConfig};

/// Checkpoints written per loop even after the write deadline passed
pub const DEFAULT_MIN_CHECKPOINTS: usize = 10;

/// Persists the aggregated history of every MPA, least recently written first
pub struct CheckpointWriter {
    client: Arc<dyn MpaClient>,
    retry: RetryConfig,
    last_written: HashMap<MpaId, DateTime<Utc>>,
}

impl CheckpointWriter {
    pub fn new(client: Arc<dyn MpaClient>) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
            last_written: HashMap::new(),
        }
    }

    /// When the MPA's checkpoints were last written
    pub fn last_written(&self, id: &MpaId) -> Option<DateTime<Utc>> {
        self.last_written.get(id).copied()
    }

    /// Writes checkpoints until `deadline` passes, but for at least
    /// `min_checkpoints` MPAs. Returns the number of checkpoint objects saved.
    pub async fn store_checkpoints(
        &mut self,
        state: &ClusterState,
        now: DateTime<Utc>,
        deadline: Instant,
        min_checkpoints: usize,
    ) -> Result<usize> {
        let mut ids = state.mpa_ids();
        self.last_written.retain(|id, _| ids.contains(id));
        ids.sort_by_key(|id| (self.last_written.get(id).copied(), id.clone()));

        let mut mpas_written = 0;
        let mut saved = 0;
        for id in ids {
            if mpas_written >= min_checkpoints && Instant::now() > deadline {
                info!(
                    written = mpas_written,
                    "Checkpoint write deadline reached, remaining MPAs wait for the next loop"
                );
                break;
            }
            let states = match state.checkpoint_states(&id, now) {
                Ok(states) => states,
                Err(e) => {
                    error!(mpa = %id, error = %e, "Cannot build checkpoints");
                    continue;
                }
            };
            for (container, aggregate) in &states {
                let mut status = aggregate.save_to_checkpoint();
                status.last_update_time = Some(now);
                let mut checkpoint = MultidimPodAutoscalerCheckpoint::new(
                    &MultidimPodAutoscalerCheckpoint::object_name(&id.mpa_name, container),
                    MultidimPodAutoscalerCheckpointSpec {
                        mpa_object_name: id.mpa_name.clone(),
                        container_name: container.clone(),
                    },
                );
                checkpoint.metadata.namespace = Some(id.namespace.clone());
                checkpoint.status = Some(status);

                let client = &self.client;
                let result = retry_with_backoff(&self.retry, "save_checkpoint", || async {
                    client.save_checkpoint(&checkpoint).await
                })
                .await;
                match result {
                    Ok(()) => {
                        saved += 1;
                        debug!(mpa = %id, container = %container, "Saved checkpoint");
                    }
                    Err(e) => error!(
                        mpa = %id,
                        container = %container,
                        error = %e,
                        "Cannot save checkpoint"
                    ),
                }
            }
            self.last_written.insert(id, now);
            mpas_written += 1;
        }
        Ok(saved)
    }
}
