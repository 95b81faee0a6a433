//! End-to-end tests for the duckagent pipeline.
//!
//! Each test drives a full run: route -> plan -> build graph -> execute -> verify
//! the RunResult and its trace.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use duckagent_core::{
    build_graph, build_run_payload, Agent, BackoffPolicy, AgentConfig, BackendKind, BackendSelector,
    BuiltinExecutor, CancelHandle, CapabilityDescriptor, CapabilityRegistry, CostEstimate,
    CostTier, Decision, EdgeKind, EventEmitter, ExecutionBackend, HostedClient, IntentTag, Node,
    NodePayload, Orchestrator, Params, Redactor, RunEvent, RunOptions, Step, StepInvocation,
    TracePhase,
};
use duckagent_core::intent::Hints;
use duckagent_core::step::DynStep;
use duckagent_types::{AgentError, NodeStatus, Result, RunContext, RunStatus};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Step returning canned outputs in order, repeating the last one.
struct Scripted {
    name: &'static str,
    outputs: Vec<Value>,
    delay: Duration,
    slow_calls: usize,
    descriptor: CapabilityDescriptor,
    calls: Arc<AtomicUsize>,
}

impl Scripted {
    fn new(name: &'static str, outputs: Vec<Value>) -> Self {
        Self {
            name,
            outputs,
            delay: Duration::ZERO,
            slow_calls: 0,
            descriptor: CapabilityDescriptor::new(CostTier::Low),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self.slow_calls = usize::MAX;
        self
    }

    /// Only the first call is delayed.
    fn slow_once(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self.slow_calls = 1;
        self
    }

    fn tier(mut self, tier: CostTier) -> Self {
        self.descriptor = CapabilityDescriptor::new(tier);
        self
    }

    fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Step for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    fn describe(&self) -> CapabilityDescriptor {
        self.descriptor.clone()
    }

    async fn invoke(&self, _params: &Params, _context: &RunContext) -> Result<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.slow_calls && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.outputs[n.min(self.outputs.len() - 1)].clone())
    }
}

fn decision(steps: &[(&str, Value)]) -> Decision {
    Decision {
        intent: IntentTag::Other("test".into()),
        confidence: 1.0,
        steps: steps
            .iter()
            .map(|(name, params)| {
                StepInvocation::new(*name, params.as_object().cloned().unwrap_or_default())
            })
            .collect(),
        cost_estimate: CostEstimate::default(),
        rationale: "test".into(),
        hints: Hints::default(),
    }
}

fn orchestrator(registry: CapabilityRegistry, config: &AgentConfig) -> (Arc<CapabilityRegistry>, Orchestrator) {
    let registry = Arc::new(registry);
    let orchestrator = Orchestrator::new(Arc::clone(&registry), config)
        .unwrap()
        .with_selector(BackendSelector::builtin_only());
    (registry, orchestrator)
}

// ---------------------------------------------------------------------------
// Agent scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn analyze_request_runs_five_steps() {
    let agent = Agent::builder().build().unwrap();
    let response = agent
        .run("analyze revenue trends for last quarter", RunOptions::default())
        .await;

    assert_eq!(response.intent.tag, IntentTag::Analyze);
    let decision = response.decision.expect("decision");
    assert_eq!(
        decision.step_names(),
        vec!["generate_sql", "validate_sql", "execute_sql", "analyze", "summarize"]
    );

    let run = response.result;
    assert_eq!(run.status, RunStatus::Succeeded, "failure: {:?}", run.failure_reason);
    assert_eq!(run.traces.len(), 5);
    assert!(run.nodes.iter().all(|n| n.status == NodeStatus::Succeeded));
    assert_eq!(run.backend, Some(BackendKind::LocalRuntime));
    assert!(run.outputs.contains_key("analyze"));
    assert!(run.summary().unwrap().starts_with("Dataset with 1 rows"));
    assert!(run.traces.iter().all(|t| t.redacted));
}

#[tokio::test]
async fn grouped_summary_request_runs_analysis_pipeline() {
    let agent = Agent::builder()
        .backends(BackendSelector::builtin_only())
        .build()
        .unwrap();
    let response = agent
        .run("Summarize revenue by country", RunOptions::default())
        .await;

    assert_eq!(response.intent.tag, IntentTag::Analyze);
    assert_eq!(response.decision.expect("decision").steps.len(), 5);
    let run = response.result;
    assert_eq!(run.status, RunStatus::Succeeded, "failure: {:?}", run.failure_reason);
    assert_eq!(run.nodes.len(), 5);
    assert_eq!(run.traces.len(), 5);
    assert!(run.nodes.iter().all(|n| n.status == NodeStatus::Succeeded));
}

#[tokio::test]
async fn explicit_dataframe_runs_single_summary() {
    let agent = Agent::builder()
        .backends(BackendSelector::builtin_only())
        .build()
        .unwrap();
    let options = RunOptions {
        table_name: Some("sales".into()),
        ..RunOptions::default()
    }
    .with_data(json!([
        {"country": "DE", "revenue": 10},
        {"country": "FR", "revenue": 7},
        {"country": "US", "revenue": 21}
    ]));
    let response = agent.run("Summarize revenue by country", options).await;

    assert_eq!(response.decision.expect("decision").step_names(), vec!["summarize"]);
    let run = response.result;
    assert!(run.succeeded(), "failure: {:?}", run.failure_reason);
    assert_eq!(run.nodes.len(), 1);
    assert_eq!(run.traces.len(), 1);
    assert_eq!(run.traces[0].step, "summarize");
    assert!(run.summary().unwrap().contains("3 rows"));
}

#[tokio::test]
async fn dataset_in_context_runs_single_summary() {
    let agent = Agent::builder()
        .backends(BackendSelector::builtin_only())
        .build()
        .unwrap();
    let options = RunOptions::default().with_context("rows_preview", json!([{"x": 1}, {"x": 2}]));
    let response = agent.run("what does this look like overall", options).await;

    assert_eq!(response.decision.unwrap().step_names(), vec!["summarize"]);
    assert!(response.result.succeeded());
    assert_eq!(response.result.traces.len(), 1);
    assert_eq!(response.result.traces[0].backend, Some(BackendKind::Builtin));
}

#[tokio::test]
async fn expensive_step_is_substituted() {
    let events = EventEmitter::new(256);
    let mut rx = events.subscribe();
    let config = AgentConfig {
        max_cost_tier: CostTier::Medium,
        ..AgentConfig::default()
    };
    let agent = Agent::builder()
        .config(config)
        .backends(BackendSelector::builtin_only())
        .events(events)
        .build()
        .unwrap();

    let run = agent
        .run("analyze churn drivers", RunOptions::default())
        .await
        .result;

    assert!(run.succeeded(), "failure: {:?}", run.failure_reason);
    assert_eq!(run.nodes.len(), 6);
    assert_eq!(run.status_of("node_3_analyze"), Some(NodeStatus::Skipped));
    let substitute = run
        .nodes
        .iter()
        .find(|n| n.step == "describe_stats")
        .expect("substitute node");
    assert_eq!(substitute.substitute_for.as_deref(), Some("node_3_analyze"));
    assert_eq!(substitute.status, NodeStatus::Succeeded);
    assert!(run
        .traces_for("node_3_analyze")
        .any(|t| t.phase == TracePhase::Substituted));

    let mut substituted = false;
    while let Ok(event) = rx.try_recv() {
        if let RunEvent::NodeSubstituted { node_id, step, .. } = event {
            assert_eq!(node_id, "node_3_analyze");
            assert_eq!(step, "describe_stats");
            substituted = true;
        }
    }
    assert!(substituted);
}

#[tokio::test]
async fn plan_maps_to_linear_graph_and_payload() {
    let agent = Agent::builder().build().unwrap();
    let (_, decision) = agent
        .plan("how many orders were placed last week", RunOptions::default())
        .await
        .unwrap();
    let graph = build_graph(&decision, agent.registry()).unwrap();

    assert_eq!(graph.len(), decision.steps.len());
    assert_eq!(graph.edges().len(), decision.steps.len() - 1);
    assert!(graph.edges().iter().all(|e| e.kind == EdgeKind::Sequential));
    assert!(graph.is_acyclic());

    let payload = build_run_payload(&graph);
    assert_eq!(payload.items.len(), graph.len());
    assert_eq!(payload.items[1].depends_on, vec![payload.items[0].id.clone()]);
}

// ---------------------------------------------------------------------------
// Orchestrator scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeout_is_retried_once_then_fails() {
    let slow = Scripted::new("slow", vec![json!({"done": true})]).slow(Duration::from_millis(500));
    let slow_calls = slow.counter();
    let after = Scripted::new("after", vec![json!({"done": true})]);
    let after_calls = after.counter();

    let mut registry = CapabilityRegistry::new();
    registry.register(slow);
    registry.register(after);
    let config = AgentConfig {
        step_timeout_ms: 30,
        ..AgentConfig::default()
    };
    let (registry, orchestrator) = orchestrator(registry, &config);

    let graph = build_graph(&decision(&[("slow", json!({})), ("after", json!({}))]), &registry).unwrap();
    let run = orchestrator.execute(graph, &RunContext::new()).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.failure_reason.as_deref().unwrap().contains("timed out"));
    assert_eq!(slow_calls.load(Ordering::SeqCst), 2);
    assert_eq!(run.traces_for("node_0_slow").count(), 2);
    assert_eq!(run.status_of("node_0_slow"), Some(NodeStatus::Failed));
    assert_eq!(run.status_of("node_1_after"), Some(NodeStatus::Skipped));
    assert_eq!(after_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn pre_check_escalation_halts_before_running() {
    let mutate = Scripted::new("mutate", vec![json!({"ok": true})]);
    let mutate_calls = mutate.counter();
    let after = Scripted::new("after", vec![json!({"ok": true})]);
    let after_calls = after.counter();

    let mut registry = CapabilityRegistry::new();
    registry.register(mutate);
    registry.register(after);
    let (registry, orchestrator) = orchestrator(registry, &AgentConfig::default());

    let graph = build_graph(
        &decision(&[("mutate", json!({"sql": "DROP TABLE users"})), ("after", json!({}))]),
        &registry,
    )
    .unwrap();
    let run = orchestrator.execute(graph, &RunContext::new()).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.failure_reason.as_deref().unwrap().contains("destructive"));
    assert_eq!(mutate_calls.load(Ordering::SeqCst), 0);
    assert_eq!(after_calls.load(Ordering::SeqCst), 0);
    assert_eq!(run.status_of("node_0_mutate"), Some(NodeStatus::Failed));
    assert_eq!(run.status_of("node_1_after"), Some(NodeStatus::Skipped));
    assert!(run
        .traces_for("node_0_mutate")
        .all(|t| t.phase == TracePhase::PreCheck));
}

#[tokio::test]
async fn post_check_retry_sample_keeps_second_output() {
    let flaky = Scripted::new(
        "flaky",
        vec![
            json!({"error": "engine hiccup"}),
            json!({"rows_preview": [{"a": 1}], "columns": ["a"]}),
        ],
    );
    let calls = flaky.counter();
    let mut registry = CapabilityRegistry::new();
    registry.register(flaky);
    let (registry, orchestrator) = orchestrator(registry, &AgentConfig::default());

    let graph = build_graph(&decision(&[("flaky", json!({"max_rows": 5000}))]), &registry).unwrap();
    let context = RunContext::new();
    let run = orchestrator.execute(graph, &context).await;

    assert!(run.succeeded(), "failure: {:?}", run.failure_reason);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let segments: Vec<_> = run.traces_for("node_0_flaky").collect();
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].status, NodeStatus::Failed);
    assert_eq!(segments[1].status, NodeStatus::Succeeded);
    assert_eq!(segments[1].input["params"]["sample_only"], true);
    assert_eq!(segments[1].input["params"]["max_rows"], 100);
    assert_eq!(run.outputs["flaky"]["rows_preview"], json!([{"a": 1}]));
    assert_eq!(context.get("rows_preview").await, Some(json!([{"a": 1}])));
}

#[tokio::test]
async fn timeout_and_resample_each_get_a_retry() {
    let step = Scripted::new(
        "reader",
        vec![
            json!({"rows_preview": [{"a": 1}], "columns": ["a"]}),
            json!({"error": "engine hiccup"}),
            json!({"rows_preview": [{"a": 2}], "columns": ["a"]}),
        ],
    )
    .slow_once(Duration::from_millis(500));
    let calls = step.counter();
    let mut registry = CapabilityRegistry::new();
    registry.register(step);
    let config = AgentConfig {
        step_timeout_ms: 30,
        ..AgentConfig::default()
    };
    let (registry, orchestrator) = orchestrator(registry, &config);

    let graph = build_graph(&decision(&[("reader", json!({}))]), &registry).unwrap();
    let run = orchestrator.execute(graph, &RunContext::new()).await;

    assert!(run.succeeded(), "failure: {:?}", run.failure_reason);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let segments: Vec<_> = run.traces_for("node_0_reader").collect();
    assert_eq!(segments.len(), 3);
    assert!(segments[0].error.as_deref().unwrap().contains("timed out"));
    assert!(segments[1].error.as_deref().unwrap().starts_with("post-check"));
    assert_eq!(run.outputs["reader"]["rows_preview"], json!([{"a": 2}]));
}

#[tokio::test]
async fn substitution_chain_stops_at_last_alternative() {
    let mut registry = CapabilityRegistry::new();
    registry.register(Scripted::new("heavy", vec![json!({})]).tier(CostTier::High));
    registry.register(Scripted::new("heavier", vec![json!({})]).tier(CostTier::High));
    registry.register_substitute("heavy", "heavier").unwrap();
    assert!(registry.register_substitute("heavier", "heavy").is_err());

    let config = AgentConfig {
        max_cost_tier: CostTier::Medium,
        ..AgentConfig::default()
    };
    let (registry, orchestrator) = orchestrator(registry, &config);
    let graph = build_graph(&decision(&[("heavy", json!({}))]), &registry).unwrap();

    let run = tokio::time::timeout(
        Duration::from_secs(2),
        orchestrator.execute(graph, &RunContext::new()),
    )
    .await
    .expect("run should terminate");

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.nodes.len(), 2);
    assert_eq!(run.status_of("node_0_heavy"), Some(NodeStatus::Skipped));
    assert_eq!(run.status_of("node_1_heavier"), Some(NodeStatus::Failed));
    assert!(run
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("no substitute available"));
}

#[tokio::test]
async fn cancellation_cuts_backoff_short() {
    let step = Scripted::new("flaky", vec![json!({"error": "engine hiccup"})]);
    let calls = step.counter();
    let mut registry = CapabilityRegistry::new();
    registry.register(step);
    let mut config = AgentConfig::default();
    config.retry.backoff = BackoffPolicy::Fixed { delay_ms: 10_000 };
    let (registry, orchestrator) = orchestrator(registry, &config);
    let graph = build_graph(&decision(&[("flaky", json!({}))]), &registry).unwrap();

    let handle = CancelHandle::new();
    let token = handle.token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });

    let run = tokio::time::timeout(
        Duration::from_secs(2),
        orchestrator.execute_with_cancel(graph, &RunContext::new(), token),
    )
    .await
    .expect("run should stop during backoff");

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.failure_reason.as_deref().unwrap().contains("cancelled"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn finalize_twice_changes_nothing() {
    let leaky = Scripted::new(
        "leaky",
        vec![json!({"api_key": "abc", "note": "use sk-abcdefghijklmnop to connect"})],
    );
    let mut registry = CapabilityRegistry::new();
    registry.register(leaky);
    let config = AgentConfig::default();
    let (registry, orchestrator) = orchestrator(registry, &config);

    let graph = build_graph(&decision(&[("leaky", json!({}))]), &registry).unwrap();
    let run = orchestrator.execute(graph, &RunContext::new()).await;

    assert_eq!(run.outputs["leaky"]["api_key"], "<REDACTED>");
    assert_eq!(run.traces[0].output["note"], "use <REDACTED> to connect");

    let again = Redactor::new(&config.redaction).unwrap().finalize(run.clone());
    assert_eq!(
        serde_json::to_value(&run).unwrap(),
        serde_json::to_value(&again).unwrap()
    );
}

#[tokio::test]
async fn cancellation_interrupts_running_node() {
    let slow = Scripted::new("slow", vec![json!({})]).slow(Duration::from_secs(5));
    let after = Scripted::new("after", vec![json!({})]);
    let mut registry = CapabilityRegistry::new();
    registry.register(slow);
    registry.register(after);
    let (registry, orchestrator) = orchestrator(registry, &AgentConfig::default());
    let graph = build_graph(&decision(&[("slow", json!({})), ("after", json!({}))]), &registry).unwrap();

    let handle = CancelHandle::new();
    let token = handle.token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });

    let run = tokio::time::timeout(
        Duration::from_secs(2),
        orchestrator.execute_with_cancel(graph, &RunContext::new(), token),
    )
    .await
    .expect("run should stop promptly");

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.failure_reason.as_deref().unwrap().contains("cancelled"));
    let interrupted: Vec<_> = run.traces_for("node_0_slow").collect();
    assert_eq!(interrupted.len(), 1);
    assert_eq!(interrupted[0].phase, TracePhase::Interrupted);
    assert_eq!(interrupted[0].error.as_deref(), Some("cancelled"));
    assert_eq!(run.status_of("node_1_after"), Some(NodeStatus::Skipped));
}

// ---------------------------------------------------------------------------
// Backend scenarios
// ---------------------------------------------------------------------------

/// Probes as available, then refuses every node.
struct VanishingHosted {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ExecutionBackend for VanishingHosted {
    fn kind(&self) -> BackendKind {
        BackendKind::HostedSdk
    }

    async fn available(&self) -> bool {
        true
    }

    async fn run(&self, _node: &Node, _step: &DynStep, _context: &RunContext) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AgentError::BackendUnavailable {
            backend: "hosted_sdk".into(),
            message: "connection reset".into(),
        })
    }
}

#[tokio::test]
async fn unavailable_backend_downgrades_for_rest_of_run() {
    let hosted_calls = Arc::new(AtomicUsize::new(0));
    let selector = BackendSelector::new(vec![
        Arc::new(VanishingHosted {
            calls: Arc::clone(&hosted_calls),
        }),
        Arc::new(BuiltinExecutor),
    ]);

    let mut registry = CapabilityRegistry::new();
    registry.register(Scripted::new("first", vec![json!({"a": 1})]));
    registry.register(Scripted::new("second", vec![json!({"b": 2})]));
    let registry = Arc::new(registry);
    let orchestrator = Orchestrator::new(Arc::clone(&registry), &AgentConfig::default())
        .unwrap()
        .with_selector(selector);

    let graph = build_graph(&decision(&[("first", json!({})), ("second", json!({}))]), &registry).unwrap();
    let run = orchestrator.execute(graph, &RunContext::new()).await;

    assert!(run.succeeded(), "failure: {:?}", run.failure_reason);
    assert_eq!(hosted_calls.load(Ordering::SeqCst), 1);
    assert_eq!(run.backend, Some(BackendKind::Builtin));
    assert_eq!(run.downgrades.len(), 1);
    assert_eq!(run.downgrades[0].from, BackendKind::HostedSdk);
    assert_eq!(run.downgrades[0].to, BackendKind::Builtin);
    assert_eq!(run.downgrades[0].node_id, "node_0_first");
    assert!(run.traces[0].notes.iter().any(|n| n.contains("downgraded")));
    assert!(run
        .traces
        .iter()
        .all(|t| t.backend == Some(BackendKind::Builtin)));
}

/// Hosted client answering every node with a fixed summary.
struct FakeHosted {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl HostedClient for FakeHosted {
    fn endpoint(&self) -> &str {
        "fake://hosted"
    }

    async fn probe(&self) -> bool {
        true
    }

    async fn submit(&self, payload: &NodePayload) -> Result<Value> {
        self.seen
            .lock()
            .unwrap()
            .push(format!("{}/{}", payload.name, payload.item.name));
        Ok(json!({"summary": "remote summary"}))
    }
}

#[tokio::test]
async fn hosted_backend_is_preferred_when_available() {
    let hosted = Arc::new(FakeHosted {
        seen: Mutex::new(Vec::new()),
    });
    let agent = Agent::builder()
        .hosted_client(Arc::clone(&hosted) as Arc<dyn HostedClient>)
        .build()
        .unwrap();

    let run = agent
        .run(
            "give me the overview",
            RunOptions::default().with_data(json!([{"a": 1}])),
        )
        .await
        .result;

    assert!(run.succeeded(), "failure: {:?}", run.failure_reason);
    assert_eq!(run.backend, Some(BackendKind::HostedSdk));
    assert_eq!(run.summary(), Some("remote summary"));
    assert_eq!(
        *hosted.seen.lock().unwrap(),
        vec!["duckagent_decision/summarize".to_string()]
    );
}

#[tokio::test]
async fn custom_step_replaces_reference_step() {
    let summarize = Scripted::new("summarize", vec![json!({"summary": "custom"})]);
    let calls = summarize.counter();
    let agent = Agent::builder()
        .backends(BackendSelector::builtin_only())
        .step(summarize)
        .build()
        .unwrap();

    let run = agent
        .run("overview please", RunOptions::default().with_data(json!([{"a": 1}])))
        .await
        .result;

    assert_eq!(run.summary(), Some("custom"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn registry_keeps_step_order() {
    let registry = duckagent_core::default_registry(None, None);
    let names: Vec<_> = registry.names().collect();
    assert_eq!(names.first(), Some(&"generate_sql"));
    assert!(registry.get("summarize").is_some());
}
