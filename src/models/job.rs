use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::models::message::ObjectKey;
use crate::services::provider::ProviderKind;

/// Status of a photo processing job.
///
/// Transitions only move forward: `Pending → Uploaded → Processing → Completed | Failed`,
/// with `Processing → Uploaded` as the single step back for a retryable provider failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Classification of a failure recorded on a FAILED job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
pub enum ErrorKind {
    Timeout,
    RateLimited,
    ServerError,
    InvalidRequest,
    MalformedResponse,
    CircuitOpen,
    Storage,
}

/// Structured error stored on a FAILED job and surfaced by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

/// Result reference stored on a COMPLETED job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResultRef {
    /// Provider-side identifier for the result.
    pub result_ref: String,
    /// Key of the image in the final namespace.
    pub object_key: String,
    pub provider: ProviderKind,
    pub metadata: serde_json::Value,
}

/// One image's unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub batch_id: Option<String>,
    /// Temp-namespace key, recorded when the upload event arrives.
    pub object_key: Option<String>,
    /// Provider hint written at presign time.
    pub provider: Option<ProviderKind>,
    pub parameters: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub provider_result: Option<ProviderResultRef>,
    pub error_info: Option<ErrorInfo>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A freshly presigned job, as the upload flow creates it.
    pub fn new(job_id: impl Into<String>, batch_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            batch_id,
            object_key: None,
            provider: None,
            parameters: serde_json::Value::Object(Default::default()),
            status: JobStatus::Pending,
            attempts: 0,
            provider_result: None,
            error_info: None,
            version: 0,
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    /// Parsed temp-namespace key, if the upload has been recorded.
    pub fn source_key(&self) -> Option<ObjectKey> {
        self.object_key.as_deref().and_then(|k| ObjectKey::parse(k).ok())
    }
}

/// Read-only view of a job returned by the orchestrator.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: String,
    pub batch_id: Option<String>,
    pub status: JobStatus,
    pub attempts: u32,
    pub version: u64,
    pub provider_result: Option<ProviderResultRef>,
    pub error_info: Option<ErrorInfo>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            batch_id: job.batch_id.clone(),
            status: job.status,
            attempts: job.attempts,
            version: job.version,
            provider_result: job.provider_result.clone(),
            error_info: job.error_info.clone(),
            updated_at: job.updated_at,
        }
    }
}
