use async_trait::async_trait;
use serde_json::json;

use duckagent_types::{AgentError, Result};

use crate::{Completion, LanguageModel, Request, Usage};

// ---------------------------------------------------------------------------
// OpenAiChat
// ---------------------------------------------------------------------------

/// Adapter for the OpenAI chat-completions endpoint.
#[derive(Debug)]
pub struct OpenAiChat {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    default_model: String,
}

impl OpenAiChat {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com".to_string(),
            default_model: "gpt-4o-mini".to_string(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let key = std::env::var("OPENAI_API_KEY").map_err(|_| AgentError::AuthError {
            provider: "openai".into(),
        })?;
        Ok(Self::new(key))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn build_request_body(&self, request: &Request) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.default_model),
            "messages": messages,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        body
    }

    fn parse_response(&self, body: serde_json::Value) -> Result<Completion> {
        let text = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AgentError::ProviderError {
                provider: "openai".into(),
                status: 200,
                message: "response contained no message content".into(),
                retryable: false,
            })?
            .to_string();
        let model = body["model"]
            .as_str()
            .unwrap_or(&self.default_model)
            .to_string();
        let usage = Usage::new(
            body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        );
        Ok(Completion { text, model, usage })
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_error(status: reqwest::StatusCode, body: &str) -> AgentError {
    let status_u16 = status.as_u16();
    match status_u16 {
        401 => AgentError::AuthError {
            provider: "openai".into(),
        },
        429 | 500 | 502 | 503 => AgentError::ProviderError {
            provider: "openai".into(),
            status: status_u16,
            message: extract_error_message(body),
            retryable: true,
        },
        _ => AgentError::ProviderError {
            provider: "openai".into(),
            status: status_u16,
            message: extract_error_message(body),
            retryable: false,
        },
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.to_string())
}

// ---------------------------------------------------------------------------
// LanguageModel implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl LanguageModel for OpenAiChat {
    fn name(&self) -> &str {
        "openai"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn complete(&self, request: &Request) -> Result<Completion> {
        let body = self.build_request_body(request);

        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::ProviderError {
                provider: "openai".into(),
                status: 0,
                message: e.to_string(),
                retryable: true,
            })?;

        let status = resp.status();
        let response_body = resp.text().await.map_err(|e| AgentError::ProviderError {
            provider: "openai".into(),
            status: 0,
            message: e.to_string(),
            retryable: true,
        })?;

        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "OpenAI request failed");
            return Err(map_error(status, &response_body));
        }

        let json: serde_json::Value = serde_json::from_str(&response_body)?;
        self.parse_response(json)
    }
}
