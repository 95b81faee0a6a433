//! Graph execution: gating, backend dispatch, retries, and tracing.
//!
//! Nodes run strictly in graph order. Each node passes through the
//! pre-execution gate, one or more attempts on the active backend, and the
//! post-execution gate. A failed node halts the run and every later node is
//! recorded as skipped.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::watch;
use uuid::Uuid;

use duckagent_types::{now, AgentError, NodeStatus, Result, RunContext, RunStatus};

use crate::backend::{ActiveBackend, BackendKind, BackendSelector};
use crate::capability::CapabilityRegistry;
use crate::config::AgentConfig;
use crate::decision::StepInvocation;
use crate::events::{EventEmitter, RunEvent};
use crate::graph::{ExecutionGraph, Node};
use crate::result::{NodeOutcome, RunResult};
use crate::retry::RetryPolicy;
use crate::step::{sample_params, DynStep};
use crate::trace::{Redactor, Segment, TracePhase, Tracer};
use crate::validator::{SuggestedAction, Validator};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Owner side of a run cancellation signal.
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct CancelToken {
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_sender, receiver) = watch::channel(false);
        Self { receiver }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    registry: Arc<CapabilityRegistry>,
    selector: BackendSelector,
    validator: Validator,
    redactor: Redactor,
    retry: RetryPolicy,
    config: AgentConfig,
    events: EventEmitter,
}

struct RunState<'a> {
    graph: ExecutionGraph,
    context: &'a RunContext,
    backend: ActiveBackend,
    tracer: Tracer,
    run: RunResult,
    cancel: CancelToken,
}

enum NodeFlow {
    Completed,
    Substituted,
    Halt(String),
}

impl Orchestrator {
    pub fn new(registry: Arc<CapabilityRegistry>, config: &AgentConfig) -> Result<Self> {
        Ok(Self {
            registry,
            selector: BackendSelector::from_config(&config.backends, None),
            validator: Validator::new(config)?,
            redactor: Redactor::new(&config.redaction)?,
            retry: config.retry.clone(),
            config: config.clone(),
            events: EventEmitter::default(),
        })
    }

    pub fn with_selector(mut self, selector: BackendSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub async fn execute(&self, graph: ExecutionGraph, context: &RunContext) -> RunResult {
        self.execute_with_cancel(graph, context, CancelToken::never())
            .await
    }

    /// Run every node of `graph` against `context`. Failures are reported in
    /// the returned [`RunResult`], never as an error.
    pub async fn execute_with_cancel(
        &self,
        mut graph: ExecutionGraph,
        context: &RunContext,
        cancel: CancelToken,
    ) -> RunResult {
        let run = RunResult::new(Uuid::new_v4());
        let timer = Instant::now();
        let mut tracer = Tracer::new(self.redactor.clone());
        self.events.emit(RunEvent::RunStarted {
            run_id: run.run_id.to_string(),
            node_count: graph.len(),
        });
        tracing::info!(run_id = %run.run_id, nodes = graph.len(), "Run started");

        let backend = match self.selector.select_backend().await {
            Ok(backend) => backend,
            Err(e) => {
                let reason = e.to_string();
                for id in graph.order().to_vec() {
                    self.skip(&mut graph, &mut tracer, &id, &reason);
                }
                return self.finish(graph, tracer, run, None, Some(reason), timer);
            }
        };
        self.events.emit(RunEvent::BackendSelected {
            backend: backend.kind(),
        });

        let mut state = RunState {
            graph,
            context,
            backend,
            tracer,
            run,
            cancel,
        };
        let mut halted: Option<String> = None;
        let mut position = 0;
        // The order can grow while iterating when a substitute is attached.
        while position < state.graph.order().len() {
            let id = state.graph.order()[position].clone();
            position += 1;

            if halted.is_none() && state.cancel.is_cancelled() {
                tracing::warn!(run_id = %state.run.run_id, node = %id, "Run cancelled");
                halted = Some(AgentError::Cancelled.to_string());
            }
            if let Some(reason) = &halted {
                self.skip(&mut state.graph, &mut state.tracer, &id, reason);
                continue;
            }

            match self.run_node(&mut state, &id).await {
                NodeFlow::Completed | NodeFlow::Substituted => {}
                NodeFlow::Halt(reason) => halted = Some(reason),
            }
        }

        let RunState {
            graph,
            backend,
            tracer,
            run,
            ..
        } = state;
        self.finish(graph, tracer, run, Some(backend.kind()), halted, timer)
    }

    fn finish(
        &self,
        graph: ExecutionGraph,
        tracer: Tracer,
        mut run: RunResult,
        backend: Option<BackendKind>,
        halted: Option<String>,
        timer: Instant,
    ) -> RunResult {
        run.backend = backend;
        run.nodes = graph
            .nodes()
            .map(|n| NodeOutcome {
                node_id: n.id.clone(),
                step: n.step().to_string(),
                status: n.status,
                substitute_for: n.substitute_for.clone(),
            })
            .collect();

        run.status = if halted.is_none() && graph.nodes().all(|n| resolved(&graph, n)) {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        if run.status == RunStatus::Failed && run.failure_reason.is_none() {
            run.failure_reason =
                Some(halted.unwrap_or_else(|| "not every node completed".to_string()));
        }
        run.ended_at = Some(now());

        let run = tracer.finalize(run);
        let duration_ms = timer.elapsed().as_millis() as u64;
        self.events.emit(RunEvent::RunCompleted {
            run_id: run.run_id.to_string(),
            status: run.status,
            duration_ms,
        });
        tracing::info!(
            run_id = %run.run_id,
            status = %run.status.as_str(),
            duration_ms,
            "Run completed"
        );
        run
    }

    async fn run_node(&self, state: &mut RunState<'_>, id: &str) -> NodeFlow {
        let Some(mut node) = state.graph.node(id).cloned() else {
            return NodeFlow::Halt(format!("node '{id}' missing from graph"));
        };
        let timer = Instant::now();
        let mut notes = Vec::new();

        let Some(step) = self.registry.get(node.step()).cloned() else {
            let reason = format!("no step registered as '{}'", node.step());
            return self.reject(state, &node, reason, notes, timer);
        };

        // Pre-execution gate
        let snapshot = state.context.snapshot().await;
        let mut gate = self.validator.pre_check(&node, &snapshot);
        if !gate.passed && gate.suggested_action == SuggestedAction::RetrySample {
            tracing::info!(node = %id, reason = %gate.reason, "Pre-check failed, narrowing to a sample");
            notes.push(format!("pre-check: {}; narrowed to sample scope", gate.reason));
            self.narrow(&mut node);
            gate = self.validator.pre_check(&node, &snapshot);
            if !gate.passed {
                gate.suggested_action = SuggestedAction::Escalate;
            }
        }
        if !gate.passed {
            match gate.suggested_action {
                SuggestedAction::Substitute => {
                    return self.substitute(state, &node, &gate.reason, notes).await;
                }
                SuggestedAction::None => self.warn(state, &node, &gate.reason, &mut notes),
                _ => {
                    let reason = format!("pre-check failed: {}", gate.reason);
                    return self.reject(state, &node, reason, notes, timer);
                }
            }
        } else if gate.is_warning() {
            self.warn(state, &node, &gate.reason, &mut notes);
        }

        // Attempts. Step failures and post-check sample retries draw on
        // separate allowances.
        let mut failures = self.retry.budget();
        let mut resamples = self.retry.budget();
        let mut attempt = 0;
        loop {
            attempt += 1;
            if attempt > 1 && !self.back_off(state, attempt - 2).await {
                tracing::warn!(node = %id, attempt, "Cancelled during backoff");
                return self.fail(state, &node, AgentError::Cancelled.to_string(), timer);
            }

            let input = input_snapshot(&node, &state.context.snapshot().await);
            state.graph.set_status(id, NodeStatus::Running);
            state.tracer.begin(&node, attempt, input.clone());
            self.events.emit(RunEvent::NodeStarted {
                node_id: id.to_string(),
                step: node.step().to_string(),
                attempt,
            });
            tracing::info!(node = %id, step = %node.step(), attempt, "Node started");

            let mut segment = Segment::new(attempt, input, NodeStatus::Failed);
            let (backend, result) = self.invoke(state, &node, &step, &mut notes).await;
            segment.backend = Some(backend);
            segment.notes = std::mem::take(&mut notes);
            segment.ended_at = now();

            let output = match result {
                Ok(output) => output,
                Err(AgentError::Cancelled) => {
                    state.tracer.interrupt("cancelled");
                    return self.fail(state, &node, AgentError::Cancelled.to_string(), timer);
                }
                Err(e) => {
                    tracing::warn!(node = %id, attempt, kind = e.kind(), error = %e, "Attempt failed");
                    segment.error = Some(e.to_string());
                    state.tracer.record(&node, TracePhase::Attempt, segment);
                    if e.is_retryable() && failures.take() {
                        self.retrying(id, attempt, &e.to_string());
                        continue;
                    }
                    return self.fail(state, &node, e.to_string(), timer);
                }
            };

            // Post-execution gate
            let snapshot = state.context.snapshot().await;
            let gate = self.validator.post_check(&node, &output, &snapshot);
            segment.output = output.clone();

            if gate.passed || gate.suggested_action == SuggestedAction::None {
                if !gate.reason.is_empty() {
                    self.warn(state, &node, &gate.reason, &mut segment.notes);
                }
                segment.status = NodeStatus::Succeeded;
                state.tracer.record(&node, TracePhase::Attempt, segment);
                self.commit(state, &node, output, timer).await;
                return NodeFlow::Completed;
            }

            segment.error = Some(format!("post-check: {}", gate.reason));
            state.tracer.record(&node, TracePhase::Attempt, segment);
            match gate.suggested_action {
                SuggestedAction::RetrySample if resamples.take() => {
                    self.narrow(&mut node);
                    self.retrying(id, attempt, &gate.reason);
                }
                SuggestedAction::Substitute => {
                    return self.substitute(state, &node, &gate.reason, Vec::new()).await;
                }
                _ => {
                    let reason = format!("post-check failed: {}", gate.reason);
                    return self.fail(state, &node, reason, timer);
                }
            }
        }
    }

    /// Dispatch one attempt to the active backend, downgrading on
    /// `BackendUnavailable` until a backend answers or none is left.
    async fn invoke(
        &self,
        state: &mut RunState<'_>,
        node: &Node,
        step: &DynStep,
        notes: &mut Vec<String>,
    ) -> (BackendKind, Result<Value>) {
        let limit = self.config.step_timeout(node.step());
        loop {
            let backend = state.backend.current();
            let kind = backend.kind();
            let call = tokio::time::timeout(limit, backend.run(node, step, state.context));
            let result = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => Err(AgentError::Cancelled),
                r = call => r.unwrap_or_else(|_| {
                    Err(AgentError::Timeout {
                        step: node.step().to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    })
                }),
            };

            match result {
                Err(e) if e.is_backend_unavailable() => {
                    let Some(downgrade) = state.backend.downgrade(&node.id, &e.to_string()).await
                    else {
                        return (kind, Err(e));
                    };
                    notes.push(format!(
                        "backend downgraded from {} to {}: {}",
                        downgrade.from, downgrade.to, downgrade.reason
                    ));
                    self.events.emit(RunEvent::BackendDowngraded {
                        from: downgrade.from,
                        to: downgrade.to,
                        node_id: node.id.clone(),
                    });
                    state.run.downgrades.push(downgrade);
                }
                other => return (kind, other),
            }
        }
    }

    /// Wait out the backoff before retry number `retry` (0-based). Returns
    /// `false` if the run was cancelled meanwhile.
    async fn back_off(&self, state: &RunState<'_>, retry: usize) -> bool {
        let delay = self.retry.backoff.delay_for_attempt(retry);
        if delay.is_zero() {
            return !state.cancel.is_cancelled();
        }
        tokio::select! {
            biased;
            _ = state.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn narrow(&self, node: &mut Node) {
        let rows = node
            .hints
            .max_rows
            .map_or(self.config.sample_rows, |m| m.min(self.config.sample_rows));
        node.invocation.params = sample_params(&node.invocation.params, rows);
        node.hints.sample_only = true;
    }

    /// Replace `node` with its registered substitute.
    async fn substitute(
        &self,
        state: &mut RunState<'_>,
        node: &Node,
        reason: &str,
        mut notes: Vec<String>,
    ) -> NodeFlow {
        let timer = Instant::now();
        let policy = self.config.substitute_policy;
        let tried = substitution_chain(&state.graph, node);
        let Some((alternative, descriptor)) = self
            .registry
            .substitute_for(node.step(), policy, &tried)
            .and_then(|alt| Some((alt.to_string(), self.registry.descriptor(alt)?)))
        else {
            let reason = format!("{reason}; no substitute available for '{}'", node.step());
            return self.reject(state, node, reason, notes, timer);
        };

        let params = if descriptor.can_run_on_sample {
            sample_params(&node.invocation.params, self.config.sample_rows)
        } else {
            node.invocation.params.clone()
        };
        let invocation = StepInvocation::new(alternative.clone(), params);
        let substitute_id = match state.graph.attach_fallback(&node.id, invocation, descriptor) {
            Ok(id) => id,
            Err(e) => return self.reject(state, node, e.to_string(), notes, timer),
        };

        state.graph.set_status(&node.id, NodeStatus::Skipped);
        notes.push(format!("substituted by {substitute_id}: {reason}"));
        let mut segment = Segment::new(
            0,
            json!({ "params": node.invocation.params }),
            NodeStatus::Skipped,
        );
        segment.notes = notes;
        state.tracer.record(node, TracePhase::Substituted, segment);
        self.events.emit(RunEvent::NodeSubstituted {
            node_id: node.id.clone(),
            substitute_id: substitute_id.clone(),
            step: alternative.clone(),
        });
        tracing::info!(
            node = %node.id,
            substitute = %substitute_id,
            step = %alternative,
            reason,
            "Node substituted"
        );
        NodeFlow::Substituted
    }

    /// Record a pre-execution rejection and fail the node.
    fn reject(
        &self,
        state: &mut RunState<'_>,
        node: &Node,
        reason: String,
        notes: Vec<String>,
        timer: Instant,
    ) -> NodeFlow {
        let mut segment = Segment::new(
            0,
            json!({ "params": node.invocation.params }),
            NodeStatus::Failed,
        );
        segment.notes = notes;
        segment.error = Some(reason.clone());
        state.tracer.record(node, TracePhase::PreCheck, segment);
        self.fail(state, node, reason, timer)
    }

    fn fail(&self, state: &mut RunState<'_>, node: &Node, reason: String, timer: Instant) -> NodeFlow {
        state.graph.set_status(&node.id, NodeStatus::Failed);
        self.events.emit(RunEvent::NodeCompleted {
            node_id: node.id.clone(),
            status: NodeStatus::Failed,
            duration_ms: timer.elapsed().as_millis() as u64,
        });
        tracing::error!(node = %node.id, step = %node.step(), reason = %reason, "Node failed");
        NodeFlow::Halt(format!("{}: {reason}", node.id))
    }

    /// Merge a successful output into the run context and the result.
    async fn commit(&self, state: &mut RunState<'_>, node: &Node, output: Value, timer: Instant) {
        if let Value::Object(map) = &output {
            state
                .context
                .apply_updates(map.clone().into_iter().collect())
                .await;
        }
        state.context.set(node.step(), output.clone()).await;
        state.run.outputs.insert(node.step().to_string(), output);
        state.graph.set_status(&node.id, NodeStatus::Succeeded);

        let duration_ms = timer.elapsed().as_millis() as u64;
        self.events.emit(RunEvent::NodeCompleted {
            node_id: node.id.clone(),
            status: NodeStatus::Succeeded,
            duration_ms,
        });
        tracing::info!(node = %node.id, step = %node.step(), duration_ms, "Node succeeded");
    }

    fn warn(&self, state: &mut RunState<'_>, node: &Node, reason: &str, notes: &mut Vec<String>) {
        tracing::warn!(node = %node.id, reason, "Validation warning");
        state.run.warnings.push(format!("{}: {reason}", node.id));
        notes.push(format!("warning: {reason}"));
        self.events.emit(RunEvent::ValidationWarning {
            node_id: node.id.clone(),
            reason: reason.to_string(),
        });
    }

    fn retrying(&self, id: &str, attempt: usize, reason: &str) {
        tracing::warn!(node = %id, attempt, reason, "Retrying node");
        self.events.emit(RunEvent::NodeRetrying {
            node_id: id.to_string(),
            attempt,
            reason: reason.to_string(),
        });
    }

    fn skip(&self, graph: &mut ExecutionGraph, tracer: &mut Tracer, id: &str, reason: &str) {
        let Some(node) = graph.node(id).cloned() else {
            return;
        };
        graph.set_status(id, NodeStatus::Skipped);
        let mut segment = Segment::new(0, Value::Null, NodeStatus::Skipped);
        segment.notes.push(format!("skipped: {reason}"));
        tracer.record(&node, TracePhase::Skipped, segment);
        self.events.emit(RunEvent::NodeSkipped {
            node_id: id.to_string(),
            reason: reason.to_string(),
        });
        tracing::debug!(node = %id, "Node skipped");
    }
}

/// A node counts as done if it succeeded, or was skipped in favour of a
/// substitute that is itself done.
fn resolved(graph: &ExecutionGraph, node: &Node) -> bool {
    match node.status {
        NodeStatus::Succeeded => true,
        NodeStatus::Skipped => graph
            .nodes()
            .filter(|n| n.substitute_for.as_deref() == Some(node.id.as_str()))
            .any(|n| resolved(graph, n)),
        _ => false,
    }
}

/// Steps already tried for the slot `node` occupies: its own step and those
/// of every original it stands in for.
fn substitution_chain(graph: &ExecutionGraph, node: &Node) -> Vec<String> {
    let mut chain = vec![node.step().to_string()];
    let mut current = node.substitute_for.as_deref();
    while let Some(original) = current.and_then(|id| graph.node(id)) {
        chain.push(original.step().to_string());
        current = original.substitute_for.as_deref();
    }
    chain
}

fn input_snapshot(node: &Node, context: &std::collections::HashMap<String, Value>) -> Value {
    let mut keys: Vec<&String> = context.keys().collect();
    keys.sort();
    json!({
        "params": node.invocation.params,
        "context_fields": keys,
    })
}
