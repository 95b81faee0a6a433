use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use duckagent_types::{AgentError, Result};

use crate::{Completion, DynModel, LanguageModel, Request, Usage};

// ---------------------------------------------------------------------------
// TokenLedger
// ---------------------------------------------------------------------------

/// Token accounting handed to models at construction time.
///
/// Each run (or each agent) owns its own ledger, so concurrent runs never
/// share counters unless a caller explicitly clones the handle.
#[derive(Debug, Clone, Default)]
pub struct TokenLedger {
    total_input: Arc<AtomicU64>,
    total_output: Arc<AtomicU64>,
    budget: Option<u64>,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger that refuses further calls once `max_tokens` have been spent.
    pub fn with_budget(max_tokens: u64) -> Self {
        Self {
            budget: Some(max_tokens),
            ..Self::default()
        }
    }

    pub fn record(&self, usage: &Usage) {
        self.total_input
            .fetch_add(usage.input_tokens, Ordering::Relaxed);
        self.total_output
            .fetch_add(usage.output_tokens, Ordering::Relaxed);
    }

    pub fn total_input_tokens(&self) -> u64 {
        self.total_input.load(Ordering::Relaxed)
    }

    pub fn total_output_tokens(&self) -> u64 {
        self.total_output.load(Ordering::Relaxed)
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_input_tokens() + self.total_output_tokens()
    }

    pub fn exhausted(&self) -> bool {
        self.budget.is_some_and(|b| self.total_tokens() >= b)
    }
}

// ---------------------------------------------------------------------------
// MeteredModel
// ---------------------------------------------------------------------------

/// Wraps a model so every completion is charged to a [`TokenLedger`].
pub struct MeteredModel {
    inner: DynModel,
    ledger: TokenLedger,
}

impl MeteredModel {
    pub fn new(inner: DynModel, ledger: TokenLedger) -> Self {
        Self { inner, ledger }
    }

    pub fn ledger(&self) -> &TokenLedger {
        &self.ledger
    }
}

#[async_trait]
impl LanguageModel for MeteredModel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn default_model(&self) -> &str {
        self.inner.default_model()
    }

    async fn complete(&self, request: &Request) -> Result<Completion> {
        if self.ledger.exhausted() {
            return Err(AgentError::ProviderError {
                provider: self.inner.name().to_string(),
                status: 0,
                message: format!(
                    "token budget exhausted after {} tokens",
                    self.ledger.total_tokens()
                ),
                retryable: false,
            });
        }
        let completion = self.inner.complete(request).await?;
        self.ledger.record(&completion.usage);
        tracing::debug!(
            provider = %self.inner.name(),
            input_tokens = completion.usage.input_tokens,
            output_tokens = completion.usage.output_tokens,
            total = self.ledger.total_tokens(),
            "LLM usage recorded"
        );
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockModel;

    #[tokio::test]
    async fn metered_model_records_usage() {
        let ledger = TokenLedger::new();
        let model = MeteredModel::new(
            DynModel::new(MockModel::scripted(vec!["abcdefgh".into()])),
            ledger.clone(),
        );
        model.generate("abcd", 8).await.unwrap();
        assert_eq!(ledger.total_input_tokens(), 1);
        assert_eq!(ledger.total_output_tokens(), 2);
        assert_eq!(ledger.total_tokens(), 3);
    }

    #[tokio::test]
    async fn budget_blocks_further_calls() {
        let ledger = TokenLedger::with_budget(1);
        let model = MeteredModel::new(DynModel::new(MockModel::new()), ledger.clone());
        model.generate("first call", 8).await.unwrap();
        assert!(ledger.exhausted());
        let err = model.generate("second call", 8).await.unwrap_err();
        assert!(err.to_string().contains("token budget exhausted"));
    }

    #[test]
    fn separate_ledgers_do_not_interfere() {
        let a = TokenLedger::new();
        let b = TokenLedger::new();
        a.record(&Usage::new(5, 5));
        assert_eq!(a.total_tokens(), 10);
        assert_eq!(b.total_tokens(), 0);
    }
}
