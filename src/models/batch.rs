use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::models::job::JobStatus;

/// Aggregate status of a batch of jobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Open,
    PartiallyComplete,
    Complete,
    CompleteWithFailures,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Complete | BatchStatus::CompleteWithFailures)
    }

    /// Derive the status from the member counters. Never cached independently.
    pub fn derive(total: u32, completed: u32, failed: u32) -> Self {
        let done = completed.saturating_add(failed);
        if done >= total {
            if failed > 0 {
                BatchStatus::CompleteWithFailures
            } else {
                BatchStatus::Complete
            }
        } else if done > 0 {
            BatchStatus::PartiallyComplete
        } else {
            BatchStatus::Open
        }
    }
}

/// A group of jobs submitted and tracked together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub batch_id: String,
    pub total_count: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    /// Member jobs already folded into the counters.
    pub counted_job_ids: Vec<String>,
    pub status: BatchStatus,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new(batch_id: impl Into<String>, total_count: u32) -> Self {
        let now = Utc::now();
        Self {
            batch_id: batch_id.into(),
            total_count,
            completed_count: 0,
            failed_count: 0,
            counted_job_ids: Vec::new(),
            status: BatchStatus::Open,
            version: 0,
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    pub fn has_counted(&self, job_id: &str) -> bool {
        self.counted_job_ids.iter().any(|id| id == job_id)
    }

    pub fn remaining(&self) -> u32 {
        self.total_count
            .saturating_sub(self.completed_count.saturating_add(self.failed_count))
    }

    /// Fold one terminal member into the counters and re-derive the status.
    ///
    /// Returns `false` without touching anything when the batch has no room left.
    pub fn record_member(&mut self, job_id: &str, status: JobStatus) -> bool {
        if self.remaining() == 0 {
            return false;
        }
        match status {
            JobStatus::Completed => self.completed_count += 1,
            JobStatus::Failed => self.failed_count += 1,
            _ => return false,
        }
        self.counted_job_ids.push(job_id.to_string());
        self.status = BatchStatus::derive(self.total_count, self.completed_count, self.failed_count);
        true
    }
}
