use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::db::PgJobStore;
use crate::services::{job_store::JobStore, queue::RedisQueue, storage::R2Client};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub store: Arc<dyn JobStore>,
    pub storage: Arc<R2Client>,
    pub queue: Arc<RedisQueue>,
    pub presign_ttl: Duration,
}

impl AppState {
    pub fn new(db: PgPool, storage: R2Client, queue: RedisQueue, presign_ttl: Duration) -> Self {
        Self {
            store: Arc::new(PgJobStore::new(db.clone())),
            db,
            storage: Arc::new(storage),
            queue: Arc::new(queue),
            presign_ttl,
        }
    }
}
