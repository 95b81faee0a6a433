use std::sync::Arc;

use async_trait::async_trait;

use duckagent_types::Result;

use crate::{Completion, Request};

// ---------------------------------------------------------------------------
// LanguageModel
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider name, e.g. `"openai"` or `"mock"`.
    fn name(&self) -> &str;

    /// Model used when the request does not name one.
    fn default_model(&self) -> &str;

    async fn complete(&self, request: &Request) -> Result<Completion>;

    /// Single-prompt convenience wrapper around [`complete`](Self::complete).
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let completion = self.complete(&Request::prompt(prompt, max_tokens)).await?;
        Ok(completion.text)
    }
}

// ---------------------------------------------------------------------------
// DynModel
// ---------------------------------------------------------------------------

/// Shared, cloneable handle to any [`LanguageModel`].
#[derive(Clone)]
pub struct DynModel(Arc<dyn LanguageModel>);

impl DynModel {
    pub fn new(model: impl LanguageModel + 'static) -> Self {
        Self(Arc::new(model))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn default_model(&self) -> &str {
        self.0.default_model()
    }

    pub async fn complete(&self, request: &Request) -> Result<Completion> {
        self.0.complete(request).await
    }

    pub async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        self.0.generate(prompt, max_tokens).await
    }
}

impl std::fmt::Debug for DynModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DynModel").field(&self.0.name()).finish()
    }
}
