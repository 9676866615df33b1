use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;

use crate::models::job::{ErrorInfo, Job, JobStatus, ProviderResultRef};
use crate::services::job_store::StoreError;
use crate::services::provider::ProviderKind;

const JOB_COLUMNS: &str = "job_id, batch_id, object_key, provider, parameters, status, attempts, \
     provider_result, error_info, version, created_at, updated_at, expires_at";

/// Insert a new job record (normally done by the presign flow).
pub async fn insert_job(pool: &PgPool, job: &Job) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO jobs (job_id, batch_id, object_key, provider, parameters, status, attempts,
                          provider_result, error_info, version, created_at, updated_at, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(&job.job_id)
    .bind(&job.batch_id)
    .bind(&job.object_key)
    .bind(job.provider.map(|p| p.to_string()))
    .bind(&job.parameters)
    .bind(job.status.to_string())
    .bind(job.attempts as i32)
    .bind(to_json(&job.provider_result)?)
    .bind(to_json(&job.error_info)?)
    .bind(job.version as i64)
    .bind(job.created_at)
    .bind(job.updated_at)
    .bind(job.expires_at)
    .execute(pool)
    .await
    .map_err(|e| insert_error(e, &job.job_id))?;

    Ok(())
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: &str) -> Result<Option<Job>, StoreError> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .map_err(backend)?;

    row.map(|r| job_from_row(&r)).transpose()
}

/// Replace a job only if its stored version still matches.
pub async fn update_job(
    pool: &PgPool,
    job: &Job,
    expected_version: u64,
) -> Result<Job, StoreError> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE jobs
        SET batch_id = $2,
            object_key = $3,
            provider = $4,
            parameters = $5,
            status = $6,
            attempts = $7,
            provider_result = $8,
            error_info = $9,
            expires_at = $10,
            version = version + 1,
            updated_at = NOW()
        WHERE job_id = $1 AND version = $11
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(&job.job_id)
    .bind(&job.batch_id)
    .bind(&job.object_key)
    .bind(job.provider.map(|p| p.to_string()))
    .bind(&job.parameters)
    .bind(job.status.to_string())
    .bind(job.attempts as i32)
    .bind(to_json(&job.provider_result)?)
    .bind(to_json(&job.error_info)?)
    .bind(job.expires_at)
    .bind(expected_version as i64)
    .fetch_optional(pool)
    .await
    .map_err(backend)?;

    match row {
        Some(r) => job_from_row(&r),
        None => match get_job(pool, &job.job_id).await? {
            Some(_) => Err(StoreError::VersionConflict {
                id: job.job_id.clone(),
                expected: expected_version,
            }),
            None => Err(StoreError::NotFound(job.job_id.clone())),
        },
    }
}

fn job_from_row(r: &PgRow) -> Result<Job, StoreError> {
    let status_str: String = r.try_get("status").map_err(backend)?;
    let status = JobStatus::from_str(&status_str)
        .map_err(|_| StoreError::Corrupt(format!("unknown job status '{}'", status_str)))?;

    let provider = r
        .try_get::<Option<String>, _>("provider")
        .map_err(backend)?
        .map(|p| {
            ProviderKind::from_str(&p)
                .map_err(|_| StoreError::Corrupt(format!("unknown provider '{}'", p)))
        })
        .transpose()?;

    let provider_result: Option<ProviderResultRef> =
        from_json(r.try_get("provider_result").map_err(backend)?)?;
    let error_info: Option<ErrorInfo> = from_json(r.try_get("error_info").map_err(backend)?)?;

    Ok(Job {
        job_id: r.try_get("job_id").map_err(backend)?,
        batch_id: r.try_get("batch_id").map_err(backend)?,
        object_key: r.try_get("object_key").map_err(backend)?,
        provider,
        parameters: r.try_get("parameters").map_err(backend)?,
        status,
        attempts: r.try_get::<i32, _>("attempts").map_err(backend)? as u32,
        provider_result,
        error_info,
        version: r.try_get::<i64, _>("version").map_err(backend)? as u64,
        created_at: r.try_get("created_at").map_err(backend)?,
        updated_at: r.try_get("updated_at").map_err(backend)?,
        expires_at: r.try_get("expires_at").map_err(backend)?,
    })
}

pub(crate) fn to_json<T: serde::Serialize>(
    value: &Option<T>,
) -> Result<Option<serde_json::Value>, StoreError> {
    value
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(
    value: Option<serde_json::Value>,
) -> Result<Option<T>, StoreError> {
    value
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| StoreError::Corrupt(e.to_string()))
}

pub(crate) fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub(crate) fn insert_error(e: sqlx::Error, id: &str) -> StoreError {
    let unique_violation = e
        .as_database_error()
        .and_then(|d| d.code())
        .is_some_and(|code| code == "23505");

    if unique_violation {
        StoreError::AlreadyExists(id.to_string())
    } else {
        backend(e)
    }
}
