//! Uniform access to the AI providers.
//!
//! Each provider is a concrete adapter behind [`ProviderAdapter`]. The
//! [`ProviderGateway`] wraps every call with a per-attempt timeout, bounded
//! retry with jittered exponential backoff, and a per-provider circuit breaker.
//! Errors are classified into retryable and non-retryable at the adapter
//! boundary so callers never need provider-specific knowledge.

pub mod circuit_breaker;
pub mod openai;
pub mod retry;
pub mod workers_ai;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::{Display, EnumString};

use crate::models::job::{ErrorKind, Job};
use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use retry::BackoffPolicy;

/// The closed set of supported providers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum ProviderKind {
    #[serde(rename = "workers_ai")]
    #[strum(serialize = "workers_ai")]
    WorkersAi,
    #[serde(rename = "openai")]
    #[strum(serialize = "openai")]
    OpenAi,
}

/// Pick the provider for a job: the presign-time hint, then
/// `parameters.provider`, then the configured default.
pub fn select_provider(job: &Job, default: ProviderKind) -> ProviderKind {
    job.provider
        .or_else(|| {
            job.parameters
                .get("provider")
                .and_then(|v| v.as_str())
                .and_then(|s| ProviderKind::from_str(s).ok())
        })
        .unwrap_or(default)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRequest {
    pub provider_kind: ProviderKind,
    /// Time-boxed URL of the source image.
    pub image_ref: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResult {
    pub result_ref: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ProviderErrorKind {
    Timeout,
    RateLimited,
    ServerError,
    InvalidRequest,
    MalformedResponse,
    CircuitOpen,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Timeout
                | ProviderErrorKind::RateLimited
                | ProviderErrorKind::ServerError
                | ProviderErrorKind::CircuitOpen
        )
    }

    /// Rejections of our own request say nothing about provider health.
    fn counts_against_provider(&self) -> bool {
        self.kind != ProviderErrorKind::InvalidRequest
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let kind = match status {
            StatusCode::TOO_MANY_REQUESTS => ProviderErrorKind::RateLimited,
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderErrorKind::Timeout,
            s if s.is_server_error() => ProviderErrorKind::ServerError,
            s if s.is_client_error() => ProviderErrorKind::InvalidRequest,
            _ => ProviderErrorKind::MalformedResponse,
        };
        let snippet: String = body.chars().take(200).collect();
        Self::new(kind, format!("HTTP {}: {}", status.as_u16(), snippet))
    }

    /// Classify a transport-level failure.
    pub fn from_transport(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            ProviderErrorKind::Timeout
        } else if e.is_decode() {
            ProviderErrorKind::MalformedResponse
        } else if let Some(status) = e.status() {
            return Self::from_status(status, &e.to_string());
        } else {
            ProviderErrorKind::ServerError
        };
        Self::new(kind, e.to_string())
    }
}

impl From<ProviderErrorKind> for ErrorKind {
    fn from(kind: ProviderErrorKind) -> Self {
        match kind {
            ProviderErrorKind::Timeout => ErrorKind::Timeout,
            ProviderErrorKind::RateLimited => ErrorKind::RateLimited,
            ProviderErrorKind::ServerError => ErrorKind::ServerError,
            ProviderErrorKind::InvalidRequest => ErrorKind::InvalidRequest,
            ProviderErrorKind::MalformedResponse => ErrorKind::MalformedResponse,
            ProviderErrorKind::CircuitOpen => ErrorKind::CircuitOpen,
        }
    }
}

/// Capability every provider adapter satisfies.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Submit one request. Implementations should honour `timeout` on their
    /// own I/O; the gateway enforces it as a hard bound regardless.
    async fn submit(
        &self,
        request: &ProviderRequest,
        timeout: Duration,
    ) -> Result<ProviderResult, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub timeout: Duration,
    /// Attempts per invocation, first call included.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub breaker: CircuitBreakerConfig,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

struct RegisteredProvider {
    adapter: Arc<dyn ProviderAdapter>,
    breaker: CircuitBreaker,
}

pub struct ProviderGateway {
    providers: HashMap<ProviderKind, RegisteredProvider>,
    settings: GatewaySettings,
}

impl ProviderGateway {
    pub fn new(settings: GatewaySettings) -> Self {
        Self {
            providers: HashMap::new(),
            settings,
        }
    }

    /// Register the adapter for `kind`, with a fresh circuit breaker.
    pub fn with_adapter(mut self, kind: ProviderKind, adapter: Arc<dyn ProviderAdapter>) -> Self {
        let breaker = CircuitBreaker::new(kind.to_string(), self.settings.breaker.clone());
        self.providers
            .insert(kind, RegisteredProvider { adapter, breaker });
        self
    }

    pub fn breaker_state(&self, kind: ProviderKind) -> Option<CircuitState> {
        self.providers.get(&kind).map(|p| p.breaker.state())
    }

    pub async fn invoke(
        &self,
        kind: ProviderKind,
        request: &ProviderRequest,
    ) -> Result<ProviderResult, ProviderError> {
        let provider = self.providers.get(&kind).ok_or_else(|| {
            ProviderError::new(
                ProviderErrorKind::InvalidRequest,
                format!("provider '{}' is not configured", kind),
            )
        })?;

        let max_attempts = self.settings.max_attempts.max(1);
        let mut delays = self.settings.backoff.schedule();
        let mut attempt = 0;

        loop {
            attempt += 1;

            if provider.breaker.try_acquire().is_err() {
                tracing::warn!(provider = %kind, "Circuit open, failing fast");
                return Err(ProviderError::new(
                    ProviderErrorKind::CircuitOpen,
                    format!("circuit open for provider '{}'", kind),
                ));
            }

            let start = Instant::now();
            let outcome = match tokio::time::timeout(
                self.settings.timeout,
                provider.adapter.submit(request, self.settings.timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::new(
                    ProviderErrorKind::Timeout,
                    format!(
                        "no response within {}ms",
                        self.settings.timeout.as_millis()
                    ),
                )),
            };
            metrics::histogram!("pipeline_provider_seconds", "provider" => kind.to_string())
                .record(start.elapsed().as_secs_f64());

            let err = match outcome {
                Ok(result) => {
                    provider.breaker.record_success();
                    return Ok(result);
                }
                Err(err) => err,
            };

            if err.counts_against_provider() {
                provider.breaker.record_failure();
            } else {
                provider.breaker.record_success();
            }

            if !err.is_retryable() || attempt >= max_attempts {
                tracing::warn!(
                    provider = %kind,
                    attempt = attempt,
                    error = %err,
                    "Provider invocation failed"
                );
                return Err(err);
            }

            let delay = delays.next_delay();
            tracing::info!(
                provider = %kind,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying provider call"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
