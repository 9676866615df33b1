//! Typed access to job and batch records.
//!
//! Every mutation is a conditional write against the record's `version`: the
//! write succeeds only if the stored version still equals `expected_version`,
//! and the stored record comes back with `version = expected_version + 1`.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::batch::Batch;
use crate::models::job::Job;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError>;

    /// Create a job record. Fails with `AlreadyExists` if the id is taken.
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Conditionally replace a job. Returns the stored record.
    async fn update_job(&self, job: &Job, expected_version: u64) -> Result<Job, StoreError>;

    async fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>, StoreError>;

    async fn insert_batch(&self, batch: &Batch) -> Result<(), StoreError>;

    /// Conditionally replace a batch. Returns the stored record.
    async fn update_batch(&self, batch: &Batch, expected_version: u64)
        -> Result<Batch, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Version conflict on {id}: expected {expected}")]
    VersionConflict { id: String, expected: u64 },

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Stored record is corrupt: {0}")]
    Corrupt(String),

    #[error("Invalid record: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Backend hiccups are worth another delivery; corrupt rows and
    /// missing records are not fixed by waiting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend(_) | StoreError::VersionConflict { .. })
    }
}

/// A batch must announce at least one member, otherwise it would be complete
/// before anything ran.
pub(crate) fn ensure_members(batch: &Batch) -> Result<(), StoreError> {
    if batch.total_count == 0 {
        return Err(StoreError::Invalid(format!(
            "batch {} has no members",
            batch.batch_id
        )));
    }
    Ok(())
}

/// In-memory store for tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
    batches: RwLock<HashMap<String, Batch>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().get(job_id).cloned())
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.job_id) {
            return Err(StoreError::AlreadyExists(job.job_id.clone()));
        }
        jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job, expected_version: u64) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write();
        let current = jobs
            .get_mut(&job.job_id)
            .ok_or_else(|| StoreError::NotFound(job.job_id.clone()))?;

        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: job.job_id.clone(),
                expected: expected_version,
            });
        }

        let mut stored = job.clone();
        stored.version = expected_version + 1;
        stored.updated_at = Utc::now();
        *current = stored.clone();
        Ok(stored)
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>, StoreError> {
        Ok(self.batches.read().get(batch_id).cloned())
    }

    async fn insert_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        ensure_members(batch)?;
        let mut batches = self.batches.write();
        if batches.contains_key(&batch.batch_id) {
            return Err(StoreError::AlreadyExists(batch.batch_id.clone()));
        }
        batches.insert(batch.batch_id.clone(), batch.clone());
        Ok(())
    }

    async fn update_batch(
        &self,
        batch: &Batch,
        expected_version: u64,
    ) -> Result<Batch, StoreError> {
        let mut batches = self.batches.write();
        let current = batches
            .get_mut(&batch.batch_id)
            .ok_or_else(|| StoreError::NotFound(batch.batch_id.clone()))?;

        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: batch.batch_id.clone(),
                expected: expected_version,
            });
        }

        let mut stored = batch.clone();
        stored.version = expected_version + 1;
        stored.updated_at = Utc::now();
        *current = stored.clone();
        Ok(stored)
    }
}
