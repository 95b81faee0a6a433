//! Interchangeable execution backends and the selector that orders them.
//!
//! Preference order is hosted run service, then a local Tokio runtime, then
//! the built-in inline executor. A run picks the first available backend
//! once and only ever moves down the list afterwards.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use duckagent_types::{now, AgentError, Result, RunContext};

use crate::config::BackendConfig;
use crate::graph::Node;
use crate::payload::NodePayload;
use crate::step::DynStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    HostedSdk,
    LocalRuntime,
    Builtin,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::HostedSdk => "hosted_sdk",
            BackendKind::LocalRuntime => "local_runtime",
            BackendKind::Builtin => "builtin",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Cheap availability probe.
    async fn available(&self) -> bool;

    async fn run(&self, node: &Node, step: &DynStep, context: &RunContext) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// Built-in executor
// ---------------------------------------------------------------------------

/// Invokes the step inline on the caller's task. Always available.
pub struct BuiltinExecutor;

#[async_trait]
impl ExecutionBackend for BuiltinExecutor {
    fn kind(&self) -> BackendKind {
        BackendKind::Builtin
    }

    async fn available(&self) -> bool {
        true
    }

    async fn run(&self, node: &Node, step: &DynStep, context: &RunContext) -> Result<Value> {
        step.invoke(&node.invocation.params, context).await
    }
}

// ---------------------------------------------------------------------------
// Local runtime
// ---------------------------------------------------------------------------

/// Runs each step on its own Tokio task. Sandboxed steps get an isolated
/// copy of the context.
pub struct LocalRuntime {
    enabled: bool,
}

impl LocalRuntime {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl ExecutionBackend for LocalRuntime {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalRuntime
    }

    async fn available(&self) -> bool {
        self.enabled && tokio::runtime::Handle::try_current().is_ok()
    }

    async fn run(&self, node: &Node, step: &DynStep, context: &RunContext) -> Result<Value> {
        let task_step = step.clone();
        let params = node.invocation.params.clone();
        let ctx = if node.requirements.sandbox {
            context.clone_isolated().await
        } else {
            context.clone()
        };

        let handle = tokio::spawn(async move { task_step.invoke(&params, &ctx).await });
        let _guard = AbortOnDrop(handle.abort_handle());
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(AgentError::StepExecution {
                step: step.name().to_string(),
                message: "step panicked".into(),
            }),
            Err(e) => Err(AgentError::BackendUnavailable {
                backend: BackendKind::LocalRuntime.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Hosted run service
// ---------------------------------------------------------------------------

#[async_trait]
pub trait HostedClient: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn probe(&self) -> bool;

    async fn submit(&self, payload: &NodePayload) -> Result<Value>;
}

/// HTTP client for the hosted run service: `GET /health`, `POST /runs`.
pub struct HttpHostedClient {
    base_url: String,
    client: reqwest::Client,
    api_key: Option<String>,
    probe_timeout: Duration,
}

impl HttpHostedClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            api_key: None,
            probe_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    fn unavailable(message: impl Into<String>) -> AgentError {
        AgentError::BackendUnavailable {
            backend: BackendKind::HostedSdk.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl HostedClient for HttpHostedClient {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn probe(&self) -> bool {
        self.client
            .get(format!("{}/health", self.base_url))
            .timeout(self.probe_timeout)
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    async fn submit(&self, payload: &NodePayload) -> Result<Value> {
        let mut request = self
            .client
            .post(format!("{}/runs", self.base_url))
            .json(payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                Self::unavailable(e.to_string())
            } else {
                AgentError::StepExecution {
                    step: payload.item.name.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Self::unavailable(e.to_string()))?;
        if matches!(status.as_u16(), 502..=504) {
            return Err(Self::unavailable(format!("HTTP {status}")));
        }
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), step = %payload.item.name, "Hosted run rejected");
            return Err(AgentError::StepExecution {
                step: payload.item.name.clone(),
                message: format!("hosted service returned HTTP {status}: {body}"),
            });
        }

        let json: Value = serde_json::from_str(&body)?;
        Ok(json.get("output").cloned().unwrap_or(json))
    }
}

/// Sends each node to a [`HostedClient`] together with a context snapshot.
pub struct HostedSdk {
    client: Arc<dyn HostedClient>,
}

impl HostedSdk {
    pub fn new(client: Arc<dyn HostedClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExecutionBackend for HostedSdk {
    fn kind(&self) -> BackendKind {
        BackendKind::HostedSdk
    }

    async fn available(&self) -> bool {
        self.client.probe().await
    }

    async fn run(&self, node: &Node, _step: &DynStep, context: &RunContext) -> Result<Value> {
        let payload = NodePayload::for_node(node, context.snapshot().await);
        tracing::debug!(node = %node.id, endpoint = %self.client.endpoint(), "Submitting node to hosted service");
        self.client.submit(&payload).await
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDowngrade {
    pub from: BackendKind,
    pub to: BackendKind,
    pub node_id: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct BackendSelector {
    backends: Vec<Arc<dyn ExecutionBackend>>,
}

impl BackendSelector {
    /// Backends in preference order.
    pub fn new(backends: Vec<Arc<dyn ExecutionBackend>>) -> Self {
        Self { backends }
    }

    pub fn builtin_only() -> Self {
        Self::new(vec![Arc::new(BuiltinExecutor)])
    }

    /// Hosted (when a client or endpoint is configured), local runtime (when
    /// enabled), then built-in.
    pub fn from_config(config: &BackendConfig, hosted: Option<Arc<dyn HostedClient>>) -> Self {
        let hosted = hosted.or_else(|| {
            config.hosted_endpoint.as_ref().map(|endpoint| {
                let mut client = HttpHostedClient::new(endpoint.clone())
                    .with_probe_timeout(Duration::from_millis(config.probe_timeout_ms));
                if let Ok(key) = std::env::var(&config.hosted_api_key_env) {
                    client = client.with_api_key(key);
                }
                Arc::new(client) as Arc<dyn HostedClient>
            })
        });

        let mut backends: Vec<Arc<dyn ExecutionBackend>> = Vec::new();
        if let Some(client) = hosted {
            backends.push(Arc::new(HostedSdk::new(client)));
        }
        if config.local_runtime {
            backends.push(Arc::new(LocalRuntime::new(true)));
        }
        backends.push(Arc::new(BuiltinExecutor));
        Self::new(backends)
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        self.backends.iter().map(|b| b.kind()).collect()
    }

    /// First available backend, probed in preference order.
    pub async fn select_backend(&self) -> Result<ActiveBackend> {
        for (index, backend) in self.backends.iter().enumerate() {
            if backend.available().await {
                tracing::info!(backend = %backend.kind(), "Backend selected");
                return Ok(ActiveBackend {
                    backends: self.backends.clone(),
                    index,
                });
            }
            tracing::debug!(backend = %backend.kind(), "Backend unavailable");
        }
        Err(AgentError::BackendUnavailable {
            backend: "any".into(),
            message: "no execution backend is available".into(),
        })
    }
}

/// Backend in use for one run.
pub struct ActiveBackend {
    backends: Vec<Arc<dyn ExecutionBackend>>,
    index: usize,
}

impl ActiveBackend {
    pub fn kind(&self) -> BackendKind {
        self.backends[self.index].kind()
    }

    pub fn current(&self) -> Arc<dyn ExecutionBackend> {
        Arc::clone(&self.backends[self.index])
    }

    /// Move to the next available backend further down the list. Returns
    /// `None` when nothing below the current backend is available.
    pub async fn downgrade(&mut self, node_id: &str, reason: &str) -> Option<BackendDowngrade> {
        let from = self.kind();
        for next in self.index + 1..self.backends.len() {
            if self.backends[next].available().await {
                self.index = next;
                let to = self.kind();
                tracing::warn!(node = %node_id, %from, %to, reason, "Backend downgraded");
                return Some(BackendDowngrade {
                    from,
                    to,
                    node_id: node_id.to_string(),
                    reason: reason.to_string(),
                    at: now(),
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Toggle {
        kind: BackendKind,
        up: AtomicBool,
    }

    impl Toggle {
        fn new(kind: BackendKind, up: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                up: AtomicBool::new(up),
            })
        }
    }

    #[async_trait]
    impl ExecutionBackend for Toggle {
        fn kind(&self) -> BackendKind {
            self.kind
        }
        async fn available(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }
        async fn run(&self, _node: &Node, _step: &DynStep, _ctx: &RunContext) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn selects_first_available() {
        let selector = BackendSelector::new(vec![
            Toggle::new(BackendKind::HostedSdk, false),
            Toggle::new(BackendKind::LocalRuntime, true),
            Arc::new(BuiltinExecutor),
        ]);
        let active = selector.select_backend().await.unwrap();
        assert_eq!(active.kind(), BackendKind::LocalRuntime);
    }

    #[tokio::test]
    async fn no_backend_available_is_error() {
        let selector = BackendSelector::new(vec![Toggle::new(BackendKind::HostedSdk, false)]);
        let err = selector.select_backend().await.err().unwrap();
        assert!(err.is_backend_unavailable());
    }

    #[tokio::test]
    async fn downgrade_is_monotonic() {
        let hosted = Toggle::new(BackendKind::HostedSdk, true);
        let local = Toggle::new(BackendKind::LocalRuntime, true);
        let selector = BackendSelector::new(vec![
            hosted.clone(),
            local.clone(),
            Arc::new(BuiltinExecutor),
        ]);
        let mut active = selector.select_backend().await.unwrap();
        assert_eq!(active.kind(), BackendKind::HostedSdk);

        let first = active.downgrade("node_0_x", "hosted went away").await.unwrap();
        assert_eq!((first.from, first.to), (BackendKind::HostedSdk, BackendKind::LocalRuntime));

        local.up.store(false, Ordering::SeqCst);
        let second = active.downgrade("node_1_x", "local went away").await.unwrap();
        assert_eq!(second.to, BackendKind::Builtin);

        // hosted recovering never moves the run back up
        hosted.up.store(true, Ordering::SeqCst);
        assert!(active.downgrade("node_2_x", "builtin failed").await.is_none());
        assert_eq!(active.kind(), BackendKind::Builtin);
    }

    #[tokio::test]
    async fn config_order_and_toggles() {
        let config = BackendConfig {
            hosted_endpoint: Some("http://127.0.0.1:9".into()),
            ..BackendConfig::default()
        };
        assert_eq!(
            BackendSelector::from_config(&config, None).kinds(),
            vec![BackendKind::HostedSdk, BackendKind::LocalRuntime, BackendKind::Builtin]
        );
        let local_off = BackendConfig {
            local_runtime: false,
            ..BackendConfig::default()
        };
        assert_eq!(
            BackendSelector::from_config(&local_off, None).kinds(),
            vec![BackendKind::Builtin]
        );
    }

    #[tokio::test]
    async fn local_runtime_is_available_inside_tokio() {
        assert!(LocalRuntime::new(true).available().await);
        assert!(!LocalRuntime::new(false).available().await);
    }

    #[tokio::test]
    async fn unreachable_hosted_service_fails_probe() {
        let client = HttpHostedClient::new("http://127.0.0.1:9/")
            .with_probe_timeout(Duration::from_millis(200));
        assert_eq!(client.endpoint(), "http://127.0.0.1:9");
        assert!(!client.probe().await);
    }
}
