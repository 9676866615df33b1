use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::models::batch::Batch;
use crate::models::job::Job;
use crate::services::job_store::{JobStore, StoreError};

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

pub mod batch_queries;
pub mod queries;

/// PostgreSQL-backed [`JobStore`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        queries::get_job(&self.pool, job_id).await
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        queries::insert_job(&self.pool, job).await
    }

    async fn update_job(&self, job: &Job, expected_version: u64) -> Result<Job, StoreError> {
        queries::update_job(&self.pool, job, expected_version).await
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>, StoreError> {
        batch_queries::get_batch(&self.pool, batch_id).await
    }

    async fn insert_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        batch_queries::insert_batch(&self.pool, batch).await
    }

    async fn update_batch(
        &self,
        batch: &Batch,
        expected_version: u64,
    ) -> Result<Batch, StoreError> {
        batch_queries::update_batch(&self.pool, batch, expected_version).await
    }
}
