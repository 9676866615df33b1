//! Wire shapes crossing the pipeline boundary: the inbound upload event, the
//! object key naming convention, and outbound notification events.

use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

pub const TEMP_PREFIX: &str = "temp";
pub const FINAL_PREFIX: &str = "final";

/// Event types accepted on the inbound queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UploadEventType {
    #[serde(rename = "object-uploaded")]
    ObjectUploaded,
}

/// Inbound queue envelope emitted when a photo lands in the temp namespace.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadMessage {
    #[garde(ascii, length(min = 1, max = 128), custom(no_separator))]
    pub job_id: String,

    #[serde(default)]
    #[garde(ascii, length(min = 1, max = 128))]
    pub batch_id: Option<String>,

    #[garde(length(min = 1, max = 1024))]
    pub object_key: String,

    #[garde(skip)]
    pub event_type: UploadEventType,
}

fn no_separator(value: &str, _ctx: &()) -> garde::Result {
    if value.contains('/') {
        return Err(garde::Error::new("must not contain '/'"));
    }
    Ok(())
}

impl UploadMessage {
    /// Deserialize and validate a raw queue payload.
    ///
    /// Any failure here is a permanent rejection of the message.
    pub fn parse(payload: &str) -> Result<(Self, ObjectKey), MessageError> {
        let message: UploadMessage = serde_json::from_str(payload)?;
        message
            .validate()
            .map_err(|e| MessageError::Invalid(e.to_string()))?;

        let key = ObjectKey::parse(&message.object_key)?;
        if key.job_id != message.job_id {
            return Err(MessageError::Invalid(format!(
                "object key '{}' does not belong to job '{}'",
                message.object_key, message.job_id
            )));
        }

        Ok((message, key))
    }
}

/// A temp-namespace object key: `temp/{jobId}/{filename}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub job_id: String,
    pub filename: String,
}

impl ObjectKey {
    pub fn new(job_id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            filename: filename.into(),
        }
    }

    pub fn parse(key: &str) -> Result<Self, MessageError> {
        let mut parts = key.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(TEMP_PREFIX), Some(job_id), Some(filename))
                if !job_id.is_empty() && !filename.is_empty() =>
            {
                Ok(Self::new(job_id, filename))
            }
            _ => Err(MessageError::InvalidKey(key.to_string())),
        }
    }

    pub fn temp_key(&self) -> String {
        format!("{}/{}/{}", TEMP_PREFIX, self.job_id, self.filename)
    }

    pub fn final_key(&self) -> String {
        format!("{}/{}/{}", FINAL_PREFIX, self.job_id, self.filename)
    }
}

/// Lifecycle event fanned out to the notification channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn for_job(job_id: &str, batch_id: Option<&str>, status: impl ToString) -> Self {
        Self {
            job_id: Some(job_id.to_string()),
            batch_id: batch_id.map(str::to_string),
            status: status.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_batch(batch_id: &str, status: impl ToString) -> Self {
        Self {
            job_id: None,
            batch_id: Some(batch_id.to_string()),
            status: status.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Deduplication key: one delivery per subject and status.
    pub fn idempotency_key(&self) -> String {
        match (&self.job_id, &self.batch_id) {
            (Some(job_id), _) => format!("job:{}:{}", job_id, self.status),
            (None, Some(batch_id)) => format!("batch:{}:{}", batch_id, self.status),
            (None, None) => format!("none:{}", self.status),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    Invalid(String),

    #[error("Object key '{0}' does not follow temp/{{jobId}}/{{filename}}")]
    InvalidKey(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_message() {
        let payload = r#"{"jobId":"J1","batchId":"B1","objectKey":"temp/J1/photo.jpg","eventType":"object-uploaded"}"#;
        let (message, key) = UploadMessage::parse(payload).unwrap();
        assert_eq!(message.job_id, "J1");
        assert_eq!(message.batch_id.as_deref(), Some("B1"));
        assert_eq!(key.filename, "photo.jpg");
        assert_eq!(key.final_key(), "final/J1/photo.jpg");
    }

    #[test]
    fn test_parse_without_batch() {
        let payload = r#"{"jobId":"J1","objectKey":"temp/J1/a.png","eventType":"object-uploaded"}"#;
        let (message, _) = UploadMessage::parse(payload).unwrap();
        assert!(message.batch_id.is_none());
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let payload = r#"{"jobId":"J1","objectKey":"temp/J1/a.png","eventType":"object-deleted"}"#;
        assert!(matches!(
            UploadMessage::parse(payload),
            Err(MessageError::Malformed(_))
        ));
    }

    #[test]
    fn test_mismatched_job_id_rejected() {
        let payload = r#"{"jobId":"J1","objectKey":"temp/J2/a.png","eventType":"object-uploaded"}"#;
        assert!(matches!(
            UploadMessage::parse(payload),
            Err(MessageError::Invalid(_))
        ));
    }

    #[test]
    fn test_empty_job_id_rejected() {
        let payload = r#"{"jobId":"","objectKey":"temp//a.png","eventType":"object-uploaded"}"#;
        assert!(UploadMessage::parse(payload).is_err());
    }

    #[test]
    fn test_object_key_requires_temp_prefix() {
        assert!(ObjectKey::parse("final/J1/a.png").is_err());
        assert!(ObjectKey::parse("temp/J1").is_err());
        assert!(ObjectKey::parse("temp/J1/").is_err());
    }

    #[test]
    fn test_object_key_keeps_nested_filename() {
        let key = ObjectKey::parse("temp/J1/2024/a.png").unwrap();
        assert_eq!(key.filename, "2024/a.png");
        assert_eq!(key.temp_key(), "temp/J1/2024/a.png");
    }

    #[test]
    fn test_idempotency_key() {
        let event = NotificationEvent::for_job("J1", None, "COMPLETED");
        assert_eq!(event.idempotency_key(), "job:J1:COMPLETED");
        let event = NotificationEvent::for_batch("B1", "COMPLETE");
        assert_eq!(event.idempotency_key(), "batch:B1:COMPLETE");
    }
}
