//! Shared types, errors, and run context for the duckagent pipeline.
//!
//! This crate provides the foundational types used across all other duckagent crates:
//! - `AgentError`: unified error taxonomy
//! - `RunContext`: shared key-value store for one run
//! - `NodeStatus` / `RunStatus`: lifecycle states of nodes and runs

use serde::{Deserialize, Serialize};

/// Unified error type for all duckagent subsystems.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // === Routing / Planning ===
    #[error("Routing ambiguous: best confidence {confidence:.2} is below threshold {threshold:.2}")]
    RoutingAmbiguous { confidence: f64, threshold: f64 },

    #[error("Planning failed for intent '{intent}': {message}")]
    Planning { intent: String, message: String },

    #[error("Graph construction failed: {0}")]
    GraphConstruction(String),

    // === Execution ===
    #[error("Validation failed on node '{node}': {reason}")]
    ValidationFailure { node: String, reason: String },

    #[error("Backend '{backend}' unavailable: {message}")]
    BackendUnavailable { backend: String, message: String },

    #[error("Step '{step}' failed: {message}")]
    StepExecution { step: String, message: String },

    #[error("Step '{step}' timed out after {timeout_ms}ms")]
    Timeout { step: String, timeout_ms: u64 },

    #[error("cancelled")]
    Cancelled,

    // === LLM Provider Errors ===
    #[error("Provider {provider} returned HTTP {status}: {message}")]
    ProviderError {
        provider: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthError { provider: String },

    // === Generic ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::StepExecution { .. }
                | AgentError::Timeout { .. }
                | AgentError::ProviderError { retryable: true, .. }
        )
    }

    /// Returns `true` for errors the orchestrator resolves by switching backend.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, AgentError::BackendUnavailable { .. })
    }

    /// Short machine-readable kind, used in traces and events.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::RoutingAmbiguous { .. } => "routing_ambiguous",
            AgentError::Planning { .. } => "planning_error",
            AgentError::GraphConstruction(_) => "graph_construction_error",
            AgentError::ValidationFailure { .. } => "validation_failure",
            AgentError::BackendUnavailable { .. } => "backend_unavailable",
            AgentError::StepExecution { .. } | AgentError::Timeout { .. } => {
                "step_execution_error"
            }
            AgentError::Cancelled => "cancelled",
            AgentError::ProviderError { .. } | AgentError::AuthError { .. } => "provider_error",
            AgentError::Config(_) => "config_error",
            AgentError::Io(_) | AgentError::Json(_) | AgentError::Other(_) => "other",
        }
    }
}

/// A convenience alias for `Result<T, AgentError>`.
pub type Result<T> = std::result::Result<T, AgentError>;

// ---------------------------------------------------------------------------
// RunContext: shared key-value store for one run
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::Arc;

/// Key-value store shared by the orchestrator and the currently running step.
///
/// Cloning a `RunContext` yields another handle to the **same** inner state.
/// Use [`clone_isolated`](RunContext::clone_isolated) to get a deep copy, for
/// instance to hand a step a view it cannot write back through.
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<tokio::sync::RwLock<ContextInner>>,
}

#[derive(Debug, Clone, Default)]
struct ContextInner {
    values: HashMap<String, serde_json::Value>,
}

impl RunContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(ContextInner::default())),
        }
    }

    /// Create a context seeded with `values`.
    pub fn from_values(values: HashMap<String, serde_json::Value>) -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(ContextInner { values })),
        }
    }

    /// Insert or overwrite a key.
    pub async fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.write().await.values.insert(key.into(), value);
    }

    /// Read a value by key (cloned).
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().await.values.get(key).cloned()
    }

    /// Convenience accessor that returns a `String`. Falls back to `default`
    /// when the key is absent or not a JSON string.
    pub async fn get_string(&self, key: &str, default: &str) -> String {
        self.inner
            .read()
            .await
            .values
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| default.to_owned())
    }

    /// Shallow copy of the current values map.
    pub async fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.inner.read().await.values.clone()
    }

    /// Deep copy that is fully independent of the original context.
    pub async fn clone_isolated(&self) -> RunContext {
        let guard = self.inner.read().await;
        RunContext {
            inner: Arc::new(tokio::sync::RwLock::new(guard.clone())),
        }
    }

    /// Merge `updates` into the context. Existing keys not present in
    /// `updates` are preserved.
    pub async fn apply_updates(&self, updates: HashMap<String, serde_json::Value>) {
        let mut guard = self.inner.write().await;
        guard.values.extend(updates);
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// NodeStatus: lifecycle of a single graph node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        }
    }
}

// ---------------------------------------------------------------------------
// RunStatus: overall outcome of a run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

/// Current UTC time, used for trace and run timestamps.
pub fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
