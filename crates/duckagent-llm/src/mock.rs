use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use duckagent_types::{AgentError, Result};

use crate::{Completion, LanguageModel, Request, Usage};

/// Deterministic model for tests and offline runs.
///
/// Scripted responses are returned in order; once exhausted the model echoes
/// the prompt back with a `[MOCK LLM]` prefix.
pub struct MockModel {
    responses: Mutex<VecDeque<String>>,
    fail: bool,
}

impl MockModel {
    /// Echo-only mock.
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fail: false,
        }
    }

    /// Mock that replays `responses` before falling back to echo.
    pub fn scripted(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            fail: false,
        }
    }

    /// Mock whose every call fails with a retryable provider error.
    pub fn failing() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fail: true,
        }
    }

    fn next_scripted(&self) -> Option<String> {
        self.responses
            .lock()
            .map(|mut queue| queue.pop_front())
            .unwrap_or(None)
    }
}

impl Default for MockModel {
    fn default() -> Self {
        Self::new()
    }
}

/// Rough token estimate: four characters per token.
fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[async_trait]
impl LanguageModel for MockModel {
    fn name(&self) -> &str {
        "mock"
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, request: &Request) -> Result<Completion> {
        if self.fail {
            return Err(AgentError::ProviderError {
                provider: "mock".into(),
                status: 503,
                message: "mock model configured to fail".into(),
                retryable: true,
            });
        }
        let prompt = request.last_text();
        let text = self.next_scripted().unwrap_or_else(|| {
            let head: String = prompt.chars().take(200).collect();
            format!("[MOCK LLM] Generated response for prompt: {head}")
        });
        let input: u64 = request
            .messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum();
        let usage = Usage::new(input, estimate_tokens(&text));
        Ok(Completion {
            text,
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.default_model().to_string()),
            usage,
        })
    }
}
