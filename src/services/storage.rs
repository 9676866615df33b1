//! Object lifecycle across the `temp/` and `final/` namespaces.
//!
//! All operations are idempotent so a redelivered message can repeat them.

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use std::time::Duration;

use crate::models::message::{ObjectKey, FINAL_PREFIX};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Copy the temp object into the final namespace, then delete the temp copy.
    /// Returns the final key. A no-op if the object was already finalized.
    async fn finalize(&self, key: &ObjectKey) -> Result<String, StorageError>;

    /// Delete everything stored for a failed job: the temp object and any final
    /// copy a half-finished finalize left behind. A no-op if already gone.
    async fn cleanup(&self, key: &ObjectKey) -> Result<(), StorageError>;

    /// Time-boxed URL to the temp object, handed to the provider.
    async fn presign_source(&self, key: &ObjectKey, ttl: Duration) -> Result<String, StorageError>;

    /// Time-boxed URL to the finalized object for `job_id`, if there is one.
    async fn presign_download(
        &self,
        job_id: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] S3Error),

    #[error("{operation} {key} returned HTTP {status}")]
    Status {
        operation: &'static str,
        key: String,
        status: u16,
    },

    #[error("Object missing from both namespaces: {0}")]
    MissingObject(String),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::S3(_) => true,
            StorageError::Status { status, .. } => *status >= 500 || matches!(status, 408 | 429),
            StorageError::MissingObject(_) | StorageError::Config(_) => false,
        }
    }
}

/// rust-s3 is built without `fail-on-err`, so error statuses come back as `Ok`.
fn check_status(operation: &'static str, key: &str, status: u16) -> Result<(), StorageError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(StorageError::Status {
            operation,
            key: key.to_string(),
            status,
        })
    }
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.bucket.head_object(key).await {
            Ok((_, 404)) | Err(S3Error::HttpFailWithBody(404, _)) => Ok(false),
            Ok((_, status)) => check_status("HEAD", key, status).map(|_| true),
            Err(e) => Err(StorageError::S3(e)),
        }
    }

    /// Delete `key`; an object that is already gone counts as deleted.
    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.bucket.delete_object(key).await?.status_code() {
            404 => Ok(()),
            status => check_status("DELETE", key, status),
        }
    }

    /// First key stored under `final/{job_id}/`.
    async fn find_final(&self, job_id: &str) -> Result<Option<String>, StorageError> {
        let prefix = format!("{}/{}/", FINAL_PREFIX, job_id);
        let pages = self.bucket.list(prefix, None).await?;
        Ok(pages
            .into_iter()
            .flat_map(|page| page.contents)
            .map(|object| object.key)
            .next())
    }

    fn ttl_secs(ttl: Duration) -> u32 {
        ttl.as_secs().clamp(1, u32::MAX as u64) as u32
    }

    /// Check bucket reachability (for health checks).
    pub async fn health_check(&self) -> Result<(), StorageError> {
        self.bucket.list("temp/".to_string(), Some("/".to_string())).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for R2Client {
    async fn finalize(&self, key: &ObjectKey) -> Result<String, StorageError> {
        let temp_key = key.temp_key();
        let final_key = key.final_key();

        if self.exists(&temp_key).await? {
            let status = self.bucket.copy_object_internal(&temp_key, &final_key).await?;
            check_status("COPY", &final_key, status)?;
            self.delete(&temp_key).await?;
            tracing::debug!(job_id = %key.job_id, final_key = %final_key, "Object finalized");
            return Ok(final_key);
        }

        if self.exists(&final_key).await? {
            tracing::debug!(job_id = %key.job_id, "Object already finalized");
            return Ok(final_key);
        }

        Err(StorageError::MissingObject(temp_key))
    }

    async fn cleanup(&self, key: &ObjectKey) -> Result<(), StorageError> {
        self.delete(&key.temp_key()).await?;
        self.delete(&key.final_key()).await?;
        tracing::debug!(job_id = %key.job_id, "Job objects removed");
        Ok(())
    }

    async fn presign_source(&self, key: &ObjectKey, ttl: Duration) -> Result<String, StorageError> {
        let url = self
            .bucket
            .presign_get(key.temp_key(), Self::ttl_secs(ttl), None)
            .await?;
        Ok(url)
    }

    async fn presign_download(
        &self,
        job_id: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StorageError> {
        let Some(final_key) = self.find_final(job_id).await? else {
            return Ok(None);
        };
        let url = self
            .bucket
            .presign_get(final_key, Self::ttl_secs(ttl), None)
            .await?;
        Ok(Some(url))
    }
}
