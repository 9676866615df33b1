use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::{ProviderAdapter, ProviderError, ProviderErrorKind, ProviderRequest, ProviderResult};

const DEFAULT_MODEL: &str = "gpt-4o-mini";

const DEFAULT_PROMPT: &str =
    "Describe this photo in one sentence, then list its main subjects as comma-separated tags.";

/// Adapter for OpenAI-compatible chat completion endpoints with image input.
pub struct OpenAiAdapter {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    id: String,
    model: String,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl OpenAiAdapter {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn submit(
        &self,
        request: &ProviderRequest,
        timeout: Duration,
    ) -> Result<ProviderResult, ProviderError> {
        let prompt = request
            .parameters
            .get("prompt")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_PROMPT);
        let max_tokens = request
            .parameters
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(300);

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url", "image_url": { "url": request.image_ref } }
                ]
            }]
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let chat: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::from_transport(e)
            } else {
                ProviderError::new(ProviderErrorKind::MalformedResponse, e.to_string())
            }
        })?;

        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                ProviderError::new(ProviderErrorKind::MalformedResponse, "no completion content")
            })?;

        Ok(ProviderResult {
            result_ref: chat.id,
            metadata: serde_json::json!({
                "model": chat.model,
                "analysis": content,
                "usage": chat.usage,
            }),
        })
    }
}
