use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::time::Instant;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub redis: ComponentHealth,
    pub storage: ComponentHealth,
    pub queue_depth: Option<u64>,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn from_result<E: std::fmt::Display>(name: &str, started: Instant, result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self {
                status: "ok".to_string(),
                latency_ms: Some(started.elapsed().as_millis() as u64),
            },
            Err(e) => {
                tracing::warn!(component = name, error = %e, "Health check failed");
                Self {
                    status: "error".to_string(),
                    latency_ms: None,
                }
            }
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// GET /health — dependency status for PostgreSQL, Redis and R2.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = Instant::now();
    let db_check = ComponentHealth::from_result(
        "database",
        start,
        sqlx::query("SELECT 1").execute(&state.db).await.map(|_| ()),
    );

    let start = Instant::now();
    let redis_check = ComponentHealth::from_result("redis", start, state.queue.health_check().await);

    let start = Instant::now();
    let storage_check =
        ComponentHealth::from_result("storage", start, state.storage.health_check().await);

    let queue_depth = if redis_check.is_ok() {
        use crate::services::queue::MessageSource;
        state.queue.depth().await.ok()
    } else {
        None
    };

    let all_healthy = db_check.is_ok() && redis_check.is_ok() && storage_check.is_ok();
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database: db_check,
            redis: redis_check,
            storage: storage_check,
            queue_depth,
        },
    };

    (status_code, Json(response))
}
