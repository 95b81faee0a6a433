//! Per-node trace segments and redaction.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use duckagent_types::{now, AgentError, NodeStatus, Result};

use crate::backend::BackendKind;
use crate::config::RedactionConfig;
use crate::graph::Node;
use crate::result::RunResult;

// ---------------------------------------------------------------------------
// NodeTrace
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TracePhase {
    /// One invocation of the step.
    Attempt,
    /// The node was rejected by the pre-execution gate.
    PreCheck,
    Skipped,
    /// The node was replaced by a substitute.
    Substituted,
    /// The node was running when the run was cancelled.
    Interrupted,
}

/// One immutable trace segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTrace {
    pub node_id: String,
    pub step: String,
    pub phase: TracePhase,
    pub attempt: usize,
    pub input: Value,
    pub output: Value,
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub backend: Option<BackendKind>,
    pub notes: Vec<String>,
    pub error: Option<String>,
    pub redacted: bool,
}

/// Fields of a segment supplied by the orchestrator.
#[derive(Debug, Clone)]
pub struct Segment {
    pub attempt: usize,
    pub input: Value,
    pub output: Value,
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub backend: Option<BackendKind>,
    pub notes: Vec<String>,
    pub error: Option<String>,
}

impl Segment {
    pub fn new(attempt: usize, input: Value, status: NodeStatus) -> Self {
        let at = now();
        Self {
            attempt,
            input,
            output: Value::Null,
            status,
            started_at: at,
            ended_at: at,
            backend: None,
            notes: Vec::new(),
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tracer
// ---------------------------------------------------------------------------

struct InFlight {
    node_id: String,
    step: String,
    attempt: usize,
    input: Value,
    started_at: DateTime<Utc>,
}

/// Collects segments for one run.
pub struct Tracer {
    segments: Vec<NodeTrace>,
    in_flight: Option<InFlight>,
    redactor: Redactor,
}

impl Tracer {
    pub fn new(redactor: Redactor) -> Self {
        Self {
            segments: Vec::new(),
            in_flight: None,
            redactor,
        }
    }

    /// Mark `node` as running so an interruption can still be recorded.
    pub fn begin(&mut self, node: &Node, attempt: usize, input: Value) {
        self.in_flight = Some(InFlight {
            node_id: node.id.clone(),
            step: node.step().to_string(),
            attempt,
            input,
            started_at: now(),
        });
    }

    pub fn record(&mut self, node: &Node, phase: TracePhase, segment: Segment) {
        if self.in_flight.as_ref().is_some_and(|f| f.node_id == node.id) {
            self.in_flight = None;
        }
        self.segments.push(NodeTrace {
            node_id: node.id.clone(),
            step: node.step().to_string(),
            phase,
            attempt: segment.attempt,
            input: segment.input,
            output: segment.output,
            status: segment.status,
            started_at: segment.started_at,
            ended_at: segment.ended_at,
            backend: segment.backend,
            notes: segment.notes,
            error: segment.error,
            redacted: false,
        });
    }

    /// Close out a node left running, recording it as failed with `reason`.
    pub fn interrupt(&mut self, reason: &str) {
        if let Some(f) = self.in_flight.take() {
            self.segments.push(NodeTrace {
                node_id: f.node_id,
                step: f.step,
                phase: TracePhase::Interrupted,
                attempt: f.attempt,
                input: f.input,
                output: Value::Null,
                status: NodeStatus::Failed,
                started_at: f.started_at,
                ended_at: now(),
                backend: None,
                notes: Vec::new(),
                error: Some(reason.to_string()),
                redacted: false,
            });
        }
    }

    /// Move the collected segments into `run` and redact it.
    pub fn finalize(mut self, mut run: RunResult) -> RunResult {
        self.interrupt("cancelled");
        run.traces.append(&mut self.segments);
        self.redactor.finalize(run)
    }
}

// ---------------------------------------------------------------------------
// Redactor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Redactor {
    keys: Vec<String>,
    patterns: Vec<Regex>,
    placeholder: String,
}

impl Redactor {
    pub fn new(config: &RedactionConfig) -> Result<Self> {
        let patterns = config
            .patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| AgentError::Config(format!("redaction pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            keys: config.keys.iter().map(|k| k.to_lowercase()).collect(),
            patterns,
            placeholder: config.placeholder.clone(),
        })
    }

    fn sensitive_key(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.keys.iter().any(|k| key.contains(k.as_str()))
    }

    pub fn redact_text(&self, text: &str) -> String {
        self.patterns.iter().fold(text.to_string(), |acc, re| {
            re.replace_all(&acc, self.placeholder.as_str()).into_owned()
        })
    }

    pub fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        let v = if self.sensitive_key(k) {
                            Value::String(self.placeholder.clone())
                        } else {
                            self.redact_value(v)
                        };
                        (k.clone(), v)
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_value(v)).collect()),
            Value::String(s) => Value::String(self.redact_text(s)),
            other => other.clone(),
        }
    }

    /// Redact every segment not yet redacted, plus the final outputs and the
    /// failure reason. Applying it twice changes nothing.
    pub fn finalize(&self, mut run: RunResult) -> RunResult {
        for trace in run.traces.iter_mut().filter(|t| !t.redacted) {
            trace.input = self.redact_value(&trace.input);
            trace.output = self.redact_value(&trace.output);
            trace.error = trace.error.as_deref().map(|e| self.redact_text(e));
            trace.notes = trace.notes.iter().map(|n| self.redact_text(n)).collect();
            trace.redacted = true;
        }
        for output in run.outputs.values_mut() {
            *output = self.redact_value(output);
        }
        run.failure_reason = run.failure_reason.as_deref().map(|r| self.redact_text(r));
        run
    }
}
