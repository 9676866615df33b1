use serde::Deserialize;
use std::time::Duration;

use crate::services::notification::NotifySettings;
use crate::services::orchestrator::OrchestratorSettings;
use crate::services::provider::circuit_breaker::CircuitBreakerConfig;
use crate::services::provider::retry::BackoffPolicy;
use crate::services::provider::{GatewaySettings, ProviderKind};
use crate::services::queue::QueueSettings;
use crate::services::worker::WorkerSettings;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the upload queue and notifications
    pub redis_url: String,

    /// Cloudflare account ID
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    pub cf_api_token: String,

    /// Workers AI model override
    pub cf_model: Option<String>,

    /// OpenAI-compatible endpoint; the OpenAI provider is only registered when a key is set
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    pub openai_model: Option<String>,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    // ── Pipeline tunables ──────────────────────────────────────────
    #[serde(default = "default_max_job_attempts")]
    pub max_job_attempts: u32,

    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,

    #[serde(default = "default_provider_max_attempts")]
    pub provider_max_attempts: u32,

    #[serde(default = "default_breaker_window")]
    pub breaker_window: usize,

    #[serde(default = "default_breaker_failure_rate")]
    pub breaker_failure_rate: f64,

    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,

    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_presign_ttl_secs")]
    pub presign_ttl_secs: u64,

    #[serde(default = "default_processing_lease_secs")]
    pub processing_lease_secs: u64,

    #[serde(default = "default_provider")]
    pub default_provider: ProviderKind,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_max_job_attempts() -> u32 {
    3
}

fn default_provider_timeout_ms() -> u64 {
    30_000
}

fn default_provider_max_attempts() -> u32 {
    3
}

fn default_breaker_window() -> usize {
    10
}

fn default_breaker_failure_rate() -> f64 {
    0.5
}

fn default_breaker_cooldown_ms() -> u64 {
    30_000
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_prefetch() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_presign_ttl_secs() -> u64 {
    900
}

fn default_processing_lease_secs() -> u64 {
    600
}

fn default_provider() -> ProviderKind {
    ProviderKind::WorkersAi
}

/// Typed settings for every pipeline component, derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub orchestrator: OrchestratorSettings,
    pub gateway: GatewaySettings,
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub notify: NotifySettings,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn pipeline(&self) -> PipelineSettings {
        PipelineSettings {
            orchestrator: OrchestratorSettings {
                max_attempts: self.max_job_attempts.max(1),
                default_provider: self.default_provider,
                presign_ttl: Duration::from_secs(self.presign_ttl_secs),
                processing_lease: Duration::from_secs(self.processing_lease_secs),
                ..OrchestratorSettings::default()
            },
            gateway: GatewaySettings {
                timeout: Duration::from_millis(self.provider_timeout_ms),
                max_attempts: self.provider_max_attempts.max(1),
                backoff: BackoffPolicy::default(),
                breaker: CircuitBreakerConfig {
                    window_size: self.breaker_window.max(1),
                    failure_rate_threshold: self.breaker_failure_rate,
                    cooldown: Duration::from_millis(self.breaker_cooldown_ms),
                },
            },
            queue: QueueSettings {
                visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
                max_deliveries: self.max_deliveries.max(1),
            },
            worker: WorkerSettings {
                prefetch: self.prefetch.max(1),
                poll_interval: Duration::from_millis(self.poll_interval_ms),
                ..WorkerSettings::default()
            },
            notify: NotifySettings::default(),
        }
    }

    /// Presigned download URL lifetime for the HTTP API.
    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Vec<(String, String)> {
        [
            ("database_url", "postgres://localhost/photos"),
            ("redis_url", "redis://localhost"),
            ("cf_account_id", "acct"),
            ("cf_api_token", "token"),
            ("r2_bucket", "photos"),
            ("r2_access_key", "ak"),
            ("r2_secret_key", "sk"),
            ("r2_endpoint", "https://r2.example.com"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_defaults_applied() {
        let config: AppConfig = envy::from_iter(minimal()).unwrap();
        let pipeline = config.pipeline();

        assert_eq!(pipeline.orchestrator.max_attempts, 3);
        assert_eq!(pipeline.orchestrator.default_provider, ProviderKind::WorkersAi);
        assert_eq!(pipeline.gateway.timeout, Duration::from_secs(30));
        assert_eq!(pipeline.gateway.breaker.window_size, 10);
        assert_eq!(pipeline.queue.max_deliveries, 5);
        assert_eq!(pipeline.worker.prefetch, 4);
        assert!(config.openai_api_key.is_none());
    }

    #[test]
    fn test_overrides() {
        let mut vars = minimal();
        vars.push(("max_job_attempts".to_string(), "5".to_string()));
        vars.push(("default_provider".to_string(), "openai".to_string()));
        vars.push(("breaker_cooldown_ms".to_string(), "1000".to_string()));

        let config: AppConfig = envy::from_iter(vars).unwrap();
        let pipeline = config.pipeline();

        assert_eq!(pipeline.orchestrator.max_attempts, 5);
        assert_eq!(pipeline.orchestrator.default_provider, ProviderKind::OpenAi);
        assert_eq!(pipeline.gateway.breaker.cooldown, Duration::from_millis(1000));
    }
}
