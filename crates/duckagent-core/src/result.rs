use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use duckagent_types::{now, NodeStatus, Result, RunStatus};

use crate::backend::{BackendDowngrade, BackendKind};
use crate::trace::NodeTrace;

/// Terminal state of one graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub node_id: String,
    pub step: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substitute_for: Option<String>,
}

/// Outcome of one run. Failures are data here, never a Rust error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Final successful output per step name.
    pub outputs: HashMap<String, Value>,
    pub failure_reason: Option<String>,
    pub traces: Vec<NodeTrace>,
    pub nodes: Vec<NodeOutcome>,
    pub backend: Option<BackendKind>,
    pub downgrades: Vec<BackendDowngrade>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunResult {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            status: RunStatus::Failed,
            outputs: HashMap::new(),
            failure_reason: None,
            traces: Vec::new(),
            nodes: Vec::new(),
            backend: None,
            downgrades: Vec::new(),
            warnings: Vec::new(),
            started_at: now(),
            ended_at: None,
        }
    }

    /// A run that failed before any node executed.
    pub fn rejected(reason: impl Into<String>) -> Self {
        let mut run = Self::new(Uuid::new_v4());
        run.failure_reason = Some(reason.into());
        run.ended_at = Some(now());
        run
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn traces_for<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a NodeTrace> {
        self.traces.iter().filter(move |t| t.node_id == node_id)
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes
            .iter()
            .find(|n| n.node_id == node_id)
            .map(|n| n.status)
    }

    /// Narrative produced by the summarize step, if it ran.
    pub fn summary(&self) -> Option<&str> {
        self.outputs
            .get("summarize")
            .and_then(|o| o.get("summary"))
            .and_then(Value::as_str)
    }

    pub fn duration_ms(&self) -> u64 {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
