use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::{ProviderAdapter, ProviderError, ProviderErrorKind, ProviderRequest, ProviderResult};

const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";
const DEFAULT_MODEL: &str = "@cf/llava-hf/llava-1.5-7b-hf";

const DEFAULT_PROMPT: &str = concat!(
    "Describe this photo. Return ONLY valid JSON with the fields ",
    "caption, subjects (array of strings) and tags (array of strings)."
);

/// Adapter for Cloudflare Workers AI vision models.
pub struct WorkersAiAdapter {
    http: Client,
    api_base: String,
    account_id: String,
    api_token: String,
    model: String,
}

#[derive(Deserialize)]
struct WorkersAiResponse {
    #[serde(default)]
    success: bool,
    result: Option<WorkersAiResult>,
}

#[derive(Deserialize)]
struct WorkersAiResult {
    description: String,
}

impl WorkersAiAdapter {
    pub fn new(account_id: String, api_token: String) -> Self {
        Self {
            http: Client::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            account_id,
            api_token,
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Download the source photo and make sure it is an image we can send.
    async fn fetch_image(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, ProviderError> {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let bytes = response.bytes().await.map_err(ProviderError::from_transport)?;
        image::guess_format(&bytes).map_err(|_| {
            ProviderError::new(
                ProviderErrorKind::InvalidRequest,
                "source object is not a supported image format",
            )
        })?;

        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ProviderAdapter for WorkersAiAdapter {
    async fn submit(
        &self,
        request: &ProviderRequest,
        timeout: Duration,
    ) -> Result<ProviderResult, ProviderError> {
        let image_bytes = self.fetch_image(&request.image_ref, timeout).await?;

        let url = format!(
            "{}/accounts/{}/ai/run/{}",
            self.api_base, self.account_id, self.model
        );

        let prompt = request
            .parameters
            .get("prompt")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_PROMPT);
        let max_tokens = request
            .parameters
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(512);

        let request_body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(&image_bytes),
            "prompt": prompt,
            "max_tokens": max_tokens
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .timeout(timeout)
            .json(&request_body)
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        let status = response.status();
        let ray_id = response
            .headers()
            .get("cf-ray")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let body: WorkersAiResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::from_transport(e)
            } else {
                ProviderError::new(ProviderErrorKind::MalformedResponse, e.to_string())
            }
        })?;

        let result = match body.result {
            Some(result) if body.success => result,
            _ => {
                return Err(ProviderError::new(
                    ProviderErrorKind::MalformedResponse,
                    "response carried no result",
                ))
            }
        };

        // The model is asked for JSON; keep the raw text when it ignores that.
        let analysis = serde_json::from_str::<serde_json::Value>(&result.description)
            .unwrap_or_else(|_| serde_json::Value::String(result.description.clone()));

        Ok(ProviderResult {
            result_ref: ray_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            metadata: serde_json::json!({
                "model": self.model,
                "analysis": analysis,
            }),
        })
    }
}
