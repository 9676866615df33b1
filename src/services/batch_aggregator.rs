//! Keeps batch counters and status consistent as member jobs finish.
//!
//! Each member is counted at most once: the batch record carries the set of
//! counted job ids, and the marker, counter and re-derived status are written
//! together in one conditional write. Contention is limited to members of the
//! same batch, so a short compare-and-swap loop is enough.

use std::sync::Arc;

use crate::models::batch::Batch;
use crate::models::job::JobStatus;
use crate::services::job_store::{JobStore, StoreError};

pub const DEFAULT_CAS_RETRIES: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Batch {batch_id} already counts {total} members; refusing to count {job_id}")]
    BatchOverflow {
        batch_id: String,
        job_id: String,
        total: u32,
    },

    #[error("Job {job_id} is not terminal ({status})")]
    NotTerminal { job_id: String, status: JobStatus },

    #[error("Gave up updating batch {0} after repeated version conflicts")]
    Contention(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AggregatorError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AggregatorError::BatchNotFound(_) | AggregatorError::Contention(_) => true,
            AggregatorError::Store(e) => e.is_retryable(),
            AggregatorError::BatchOverflow { .. } | AggregatorError::NotTerminal { .. } => false,
        }
    }
}

/// Result of folding one member into its batch.
#[derive(Debug, Clone)]
pub struct BatchUpdate {
    pub batch: Batch,
    /// `false` when the member had already been counted.
    pub changed: bool,
    /// `true` when this update moved the batch into a terminal status.
    pub became_terminal: bool,
}

#[derive(Clone)]
pub struct BatchAggregator {
    store: Arc<dyn JobStore>,
    max_retries: u32,
}

impl BatchAggregator {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            max_retries: DEFAULT_CAS_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub async fn on_member_terminal(
        &self,
        batch_id: &str,
        job_id: &str,
        status: JobStatus,
    ) -> Result<BatchUpdate, AggregatorError> {
        if !status.is_terminal() {
            return Err(AggregatorError::NotTerminal {
                job_id: job_id.to_string(),
                status,
            });
        }

        for attempt in 1..=self.max_retries {
            let batch = self
                .store
                .get_batch(batch_id)
                .await?
                .ok_or_else(|| AggregatorError::BatchNotFound(batch_id.to_string()))?;

            if batch.has_counted(job_id) {
                tracing::debug!(batch_id = %batch_id, job_id = %job_id, "Member already counted");
                return Ok(BatchUpdate {
                    batch,
                    changed: false,
                    became_terminal: false,
                });
            }

            let expected_version = batch.version;
            let was_terminal = batch.status.is_terminal();
            let mut next = batch;
            if !next.record_member(job_id, status) {
                return Err(AggregatorError::BatchOverflow {
                    batch_id: batch_id.to_string(),
                    job_id: job_id.to_string(),
                    total: next.total_count,
                });
            }

            match self.store.update_batch(&next, expected_version).await {
                Ok(stored) => {
                    tracing::info!(
                        batch_id = %batch_id,
                        job_id = %job_id,
                        completed = stored.completed_count,
                        failed = stored.failed_count,
                        total = stored.total_count,
                        status = %stored.status,
                        "Batch member counted"
                    );
                    let became_terminal = !was_terminal && stored.status.is_terminal();
                    return Ok(BatchUpdate {
                        batch: stored,
                        changed: true,
                        became_terminal,
                    });
                }
                Err(StoreError::VersionConflict { .. }) => {
                    tracing::debug!(
                        batch_id = %batch_id,
                        job_id = %job_id,
                        attempt = attempt,
                        "Batch version conflict, re-reading"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AggregatorError::Contention(batch_id.to_string()))
    }
}
