//! The job state machine.
//!
//! ```text
//! PENDING --object-uploaded--> UPLOADED --begin-processing--> PROCESSING
//! PROCESSING --provider-success--> COMPLETED
//! PROCESSING --retryable failure, attempts < max--> UPLOADED
//! PROCESSING --terminal failure or attempts >= max--> FAILED
//! ```
//!
//! The COMPLETED edge moves the photo into `final/` before the write, so a
//! completed job always points at an object that exists. A provider error that
//! survives the gateway's own retries is terminal; only an open circuit, which
//! never reached the provider, sends the job back for redelivery.
//!
//! Events that do not match the current status are no-ops. Every mutation is a
//! single conditional write on the job's version; losing that race surfaces as
//! [`OrchestratorError::ConcurrencyConflict`] and the caller retries from a
//! fresh read.

use chrono::Utc;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::models::job::{ErrorInfo, ErrorKind, Job, JobSnapshot, JobStatus, ProviderResultRef};
use crate::models::message::{NotificationEvent, ObjectKey};
use crate::services::batch_aggregator::{AggregatorError, BatchAggregator};
use crate::services::job_store::{JobStore, StoreError};
use crate::services::notification::NotificationDispatcher;
use crate::services::provider::{
    select_provider, ProviderError, ProviderErrorKind, ProviderGateway, ProviderKind,
    ProviderRequest,
};
use crate::services::storage::{ObjectStore, StorageError};

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    ObjectUploaded { object_key: String },
    /// Moves the job to PROCESSING and drives the provider call to an outcome.
    BeginProcessing,
    ProviderSuccess(ProviderResultRef),
    ProviderFailure(FailureReport),
}

impl JobEvent {
    fn name(&self) -> &'static str {
        match self {
            JobEvent::ObjectUploaded { .. } => "object-uploaded",
            JobEvent::BeginProcessing => "begin-processing",
            JobEvent::ProviderSuccess(_) => "provider-success",
            JobEvent::ProviderFailure(f) if f.retryable => "provider-retryable-failure",
            JobEvent::ProviderFailure(_) => "provider-terminal-failure",
        }
    }
}

/// Why a processing attempt did not produce a result.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl FailureReport {
    fn storage(e: StorageError) -> Self {
        Self {
            kind: ErrorKind::Storage,
            message: e.to_string(),
            retryable: false,
        }
    }

    fn no_object() -> Self {
        Self {
            kind: ErrorKind::InvalidRequest,
            message: "job has no uploaded object".to_string(),
            retryable: false,
        }
    }

    fn lease_expired() -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: "processing lease expired before a result was recorded".to_string(),
            retryable: true,
        }
    }
}

/// Outcome of a whole gateway invocation. Retries already happened inside it,
/// so a retryable kind here means the attempts are exhausted.
impl From<ProviderError> for FailureReport {
    fn from(e: ProviderError) -> Self {
        let exhausted = e.is_retryable() && e.kind != ProviderErrorKind::CircuitOpen;
        Self {
            kind: e.kind.into(),
            retryable: e.kind == ProviderErrorKind::CircuitOpen,
            message: if exhausted {
                format!("{} (provider attempts exhausted)", e.message)
            } else {
                e.message
            },
        }
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Apply `event` to `job`, returning the record to write, or `None` when the
/// event does not apply to the current status.
pub fn transition(job: &Job, event: &JobEvent, max_attempts: u32) -> Option<Job> {
    let mut next = job.clone();
    match (job.status, event) {
        (JobStatus::Pending, JobEvent::ObjectUploaded { object_key }) => {
            next.status = JobStatus::Uploaded;
            next.object_key = Some(object_key.clone());
        }
        (JobStatus::Uploaded, JobEvent::BeginProcessing) => {
            next.status = JobStatus::Processing;
            next.attempts = job.attempts + 1;
        }
        (JobStatus::Processing, JobEvent::ProviderSuccess(result)) => {
            next.status = JobStatus::Completed;
            next.provider_result = Some(result.clone());
            next.error_info = None;
        }
        (JobStatus::Processing, JobEvent::ProviderFailure(failure))
            if failure.retryable && job.attempts < max_attempts =>
        {
            next.status = JobStatus::Uploaded;
        }
        (JobStatus::Processing, JobEvent::ProviderFailure(failure)) => {
            next.status = JobStatus::Failed;
            // A FAILED job is never picked up again, whatever caused it.
            next.error_info = Some(ErrorInfo {
                kind: failure.kind,
                message: failure.message.clone(),
                retryable: false,
            });
            next.provider_result = None;
        }
        _ => return None,
    }
    Some(next)
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Invalid event: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Concurrent update on job {0}")]
    ConcurrencyConflict(String),

    #[error("Job {job_id} returned to the queue after attempt {attempts}: {failure}")]
    RetryScheduled {
        job_id: String,
        attempts: u32,
        failure: FailureReport,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Batch update failed: {0}")]
    Batch(#[from] AggregatorError),
}

impl OrchestratorError {
    /// Whether redelivering the triggering message can make progress.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::Validation(_) => false,
            OrchestratorError::JobNotFound(_)
            | OrchestratorError::ConcurrencyConflict(_)
            | OrchestratorError::RetryScheduled { .. } => true,
            OrchestratorError::Storage(e) => e.is_retryable(),
            OrchestratorError::Store(e) => e.is_retryable(),
            OrchestratorError::Batch(e) => e.is_retryable(),
        }
    }

    fn from_store(e: StoreError, job_id: &str) -> Self {
        match e {
            StoreError::VersionConflict { .. } => {
                OrchestratorError::ConcurrencyConflict(job_id.to_string())
            }
            StoreError::NotFound(_) => OrchestratorError::JobNotFound(job_id.to_string()),
            other => OrchestratorError::Store(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Job-level cap on provider attempts across redeliveries.
    pub max_attempts: u32,
    pub default_provider: ProviderKind,
    /// Lifetime of the source URL handed to the provider.
    pub presign_ttl: Duration,
    /// A PROCESSING job untouched for this long is assumed abandoned.
    pub processing_lease: Duration,
    pub storage_attempts: u32,
    pub storage_retry_delay: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            default_provider: ProviderKind::WorkersAi,
            presign_ttl: Duration::from_secs(900),
            processing_lease: Duration::from_secs(600),
            storage_attempts: 3,
            storage_retry_delay: Duration::from_millis(100),
        }
    }
}

pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    objects: Arc<dyn ObjectStore>,
    gateway: Arc<ProviderGateway>,
    notifier: Arc<NotificationDispatcher>,
    aggregator: BatchAggregator,
    settings: OrchestratorSettings,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        objects: Arc<dyn ObjectStore>,
        gateway: Arc<ProviderGateway>,
        notifier: Arc<NotificationDispatcher>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            aggregator: BatchAggregator::new(store.clone()),
            store,
            objects,
            gateway,
            notifier,
            settings,
        }
    }

    /// Apply one event to one job. Every side effect has completed (or failed)
    /// by the time this returns.
    pub async fn process(
        &self,
        job_id: &str,
        event: JobEvent,
    ) -> Result<JobSnapshot, OrchestratorError> {
        if let JobEvent::ObjectUploaded { object_key } = &event {
            let key = ObjectKey::parse(object_key)
                .map_err(|e| OrchestratorError::Validation(e.to_string()))?;
            if key.job_id != job_id {
                return Err(OrchestratorError::Validation(format!(
                    "object key '{}' does not belong to job '{}'",
                    object_key, job_id
                )));
            }
        }

        let job = self.load(job_id).await?;
        let job = match event {
            JobEvent::BeginProcessing => return self.begin_processing(job).await,
            other => self.apply(job, other).await?,
        };
        Ok(JobSnapshot::from(&job))
    }

    async fn load(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        self.store
            .get_job(job_id)
            .await
            .map_err(|e| OrchestratorError::from_store(e, job_id))?
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))
    }

    /// Run the transition for `event` and its side effects.
    async fn apply(&self, job: Job, event: JobEvent) -> Result<Job, OrchestratorError> {
        let event = match event {
            JobEvent::ProviderSuccess(result) if job.status == JobStatus::Processing => {
                self.finalize(&job, result).await
            }
            other => other,
        };

        let Some(next) = transition(&job, &event, self.settings.max_attempts) else {
            tracing::debug!(
                job_id = %job.job_id,
                status = %job.status,
                event = event.name(),
                "Event does not apply to current status, ignoring"
            );
            if job.status.is_terminal() {
                self.settle(&job).await?;
            }
            return Ok(job);
        };

        let stored = self
            .store
            .update_job(&next, job.version)
            .await
            .map_err(|e| OrchestratorError::from_store(e, &job.job_id))?;

        tracing::info!(
            job_id = %stored.job_id,
            batch_id = ?stored.batch_id,
            from = %job.status,
            to = %stored.status,
            event = event.name(),
            attempts = stored.attempts,
            version = stored.version,
            "Job transitioned"
        );

        match stored.status {
            JobStatus::Completed => {
                metrics::counter!("pipeline_jobs_completed_total").increment(1);
                self.settle(&stored).await?;
            }
            JobStatus::Failed => {
                metrics::counter!("pipeline_jobs_failed_total").increment(1);
                self.settle(&stored).await?;
            }
            _ => {}
        }

        Ok(stored)
    }

    async fn begin_processing(&self, mut job: Job) -> Result<JobSnapshot, OrchestratorError> {
        if job.status == JobStatus::Processing && self.lease_expired(&job) {
            tracing::warn!(
                job_id = %job.job_id,
                attempts = job.attempts,
                "Processing lease expired, reclaiming job"
            );
            job = self
                .apply(job, JobEvent::ProviderFailure(FailureReport::lease_expired()))
                .await?;
        }

        if job.status != JobStatus::Uploaded {
            return Ok(JobSnapshot::from(&self.apply(job, JobEvent::BeginProcessing).await?));
        }

        let processing = self.apply(job, JobEvent::BeginProcessing).await?;
        let event = match self.run_provider(&processing).await {
            Ok(result) => JobEvent::ProviderSuccess(result),
            Err(failure) => JobEvent::ProviderFailure(failure),
        };
        let retry = match &event {
            JobEvent::ProviderFailure(f) if f.retryable => Some(f.clone()),
            _ => None,
        };

        let stored = self.apply(processing, event).await?;
        match retry {
            Some(failure) if stored.status == JobStatus::Uploaded => {
                Err(OrchestratorError::RetryScheduled {
                    job_id: stored.job_id,
                    attempts: stored.attempts,
                    failure,
                })
            }
            _ => Ok(JobSnapshot::from(&stored)),
        }
    }

    fn lease_expired(&self, job: &Job) -> bool {
        let lease = chrono::Duration::from_std(self.settings.processing_lease)
            .unwrap_or(chrono::Duration::MAX);
        Utc::now().signed_duration_since(job.updated_at) > lease
    }

    async fn run_provider(&self, job: &Job) -> Result<ProviderResultRef, FailureReport> {
        let key = job.source_key().ok_or_else(FailureReport::no_object)?;
        let kind = select_provider(job, self.settings.default_provider);
        let objects = &self.objects;
        let key_ref = &key;
        let ttl = self.settings.presign_ttl;

        let image_ref = self
            .storage_retry("presign", &job.job_id, move || objects.presign_source(key_ref, ttl))
            .await
            .map_err(FailureReport::storage)?;

        let request = ProviderRequest {
            provider_kind: kind,
            image_ref,
            parameters: job.parameters.clone(),
        };

        tracing::info!(job_id = %job.job_id, provider = %kind, attempt = job.attempts, "Invoking provider");
        let result = self.gateway.invoke(kind, &request).await?;

        Ok(ProviderResultRef {
            result_ref: result.result_ref,
            object_key: key.final_key(),
            provider: kind,
            metadata: result.metadata,
        })
    }

    /// Move the photo into `final/` ahead of the COMPLETED write. Storage
    /// exhaustion turns the success into a Storage failure.
    async fn finalize(&self, job: &Job, mut result: ProviderResultRef) -> JobEvent {
        let Some(key) = job.source_key() else {
            return JobEvent::ProviderFailure(FailureReport::no_object());
        };
        let objects = &self.objects;
        let key_ref = &key;
        match self
            .storage_retry("finalize", &job.job_id, move || objects.finalize(key_ref))
            .await
        {
            Ok(final_key) => {
                result.object_key = final_key;
                JobEvent::ProviderSuccess(result)
            }
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "Finalize failed, failing job");
                JobEvent::ProviderFailure(FailureReport::storage(e))
            }
        }
    }

    /// Terminal side effects. Safe to repeat: cleanup is idempotent, the
    /// dispatcher deduplicates and the aggregator counts each member once.
    async fn settle(&self, job: &Job) -> Result<(), OrchestratorError> {
        if job.status == JobStatus::Failed {
            if let Some(key) = job.source_key() {
                let objects = &self.objects;
                let key_ref = &key;
                self.storage_retry("cleanup", &job.job_id, move || objects.cleanup(key_ref))
                    .await?;
            }
        }

        self.notifier
            .notify(NotificationEvent::for_job(
                &job.job_id,
                job.batch_id.as_deref(),
                job.status,
            ))
            .await;

        if let Some(batch_id) = &job.batch_id {
            let update = self
                .aggregator
                .on_member_terminal(batch_id, &job.job_id, job.status)
                .await?;
            if update.became_terminal {
                self.notifier
                    .notify(NotificationEvent::for_batch(batch_id, update.batch.status))
                    .await;
            }
        }

        Ok(())
    }

    async fn storage_retry<T, F, Fut>(
        &self,
        op: &str,
        job_id: &str,
        mut f: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let attempts = self.settings.storage_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::warn!(job_id = %job_id, op = op, attempt = attempt, error = %e, "Storage call failed, retrying");
                    tokio::time::sleep(self.settings.storage_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
