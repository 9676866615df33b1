use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;

use crate::db::queries::{backend, insert_error};
use crate::models::batch::{Batch, BatchStatus};
use crate::services::job_store::{ensure_members, StoreError};

const BATCH_COLUMNS: &str = "batch_id, total_count, completed_count, failed_count, \
     counted_job_ids, status, version, created_at, updated_at, expires_at";

/// Insert a new batch record
pub async fn insert_batch(pool: &PgPool, batch: &Batch) -> Result<(), StoreError> {
    ensure_members(batch)?;
    sqlx::query(
        r#"
        INSERT INTO batches (batch_id, total_count, completed_count, failed_count,
                             counted_job_ids, status, version, created_at, updated_at, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(&batch.batch_id)
    .bind(batch.total_count as i32)
    .bind(batch.completed_count as i32)
    .bind(batch.failed_count as i32)
    .bind(&batch.counted_job_ids)
    .bind(batch.status.to_string())
    .bind(batch.version as i64)
    .bind(batch.created_at)
    .bind(batch.updated_at)
    .bind(batch.expires_at)
    .execute(pool)
    .await
    .map_err(|e| insert_error(e, &batch.batch_id))?;

    Ok(())
}

/// Get a batch by ID
pub async fn get_batch(pool: &PgPool, batch_id: &str) -> Result<Option<Batch>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {BATCH_COLUMNS} FROM batches WHERE batch_id = $1"
    ))
    .bind(batch_id)
    .fetch_optional(pool)
    .await
    .map_err(backend)?;

    row.map(|r| batch_from_row(&r)).transpose()
}

/// Replace counters, marker set and status in one conditional write.
///
/// The table's CHECK constraint on `completed_count + failed_count <= total_count`
/// backs up the invariant the aggregator already enforces.
pub async fn update_batch(
    pool: &PgPool,
    batch: &Batch,
    expected_version: u64,
) -> Result<Batch, StoreError> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE batches
        SET completed_count = $2,
            failed_count = $3,
            counted_job_ids = $4,
            status = $5,
            expires_at = $6,
            version = version + 1,
            updated_at = NOW()
        WHERE batch_id = $1 AND version = $7
        RETURNING {BATCH_COLUMNS}
        "#
    ))
    .bind(&batch.batch_id)
    .bind(batch.completed_count as i32)
    .bind(batch.failed_count as i32)
    .bind(&batch.counted_job_ids)
    .bind(batch.status.to_string())
    .bind(batch.expires_at)
    .bind(expected_version as i64)
    .fetch_optional(pool)
    .await
    .map_err(backend)?;

    match row {
        Some(r) => batch_from_row(&r),
        None => match get_batch(pool, &batch.batch_id).await? {
            Some(_) => Err(StoreError::VersionConflict {
                id: batch.batch_id.clone(),
                expected: expected_version,
            }),
            None => Err(StoreError::NotFound(batch.batch_id.clone())),
        },
    }
}

fn batch_from_row(r: &PgRow) -> Result<Batch, StoreError> {
    let status_str: String = r.try_get("status").map_err(backend)?;
    let status = BatchStatus::from_str(&status_str)
        .map_err(|_| StoreError::Corrupt(format!("unknown batch status '{}'", status_str)))?;

    Ok(Batch {
        batch_id: r.try_get("batch_id").map_err(backend)?,
        total_count: r.try_get::<i32, _>("total_count").map_err(backend)? as u32,
        completed_count: r.try_get::<i32, _>("completed_count").map_err(backend)? as u32,
        failed_count: r.try_get::<i32, _>("failed_count").map_err(backend)? as u32,
        counted_job_ids: r.try_get("counted_job_ids").map_err(backend)?,
        status,
        version: r.try_get::<i64, _>("version").map_err(backend)? as u64,
        created_at: r.try_get("created_at").map_err(backend)?,
        updated_at: r.try_get("updated_at").map_err(backend)?,
        expires_at: r.try_get("expires_at").map_err(backend)?,
    })
}
