//! Decision-to-execution pipeline for natural-language analytics requests.
//!
//! A prompt is routed to an [`Intent`], expanded by the [`Planner`] into a
//! [`Decision`], compiled into an [`ExecutionGraph`], and executed by the
//! [`Orchestrator`] on the best available backend. The validator gates every
//! node before and after it runs, and the tracer records a redacted segment
//! per attempt. [`Agent`] wires the whole chain behind one call.

pub mod agent;
pub mod backend;
pub mod capability;
pub mod config;
pub mod decision;
pub mod events;
pub mod graph;
pub mod intent;
pub mod orchestrator;
pub mod payload;
pub mod planner;
pub mod result;
pub mod retry;
pub mod router;
pub mod sink;
pub mod sqltext;
pub mod step;
pub mod steps;
pub mod trace;
pub mod validator;

pub use agent::{Agent, AgentBuilder, AgentResponse, RunOptions};
pub use backend::{
    ActiveBackend, BackendDowngrade, BackendKind, BackendSelector, BuiltinExecutor,
    ExecutionBackend, HostedClient, HostedSdk, HttpHostedClient, LocalRuntime,
};
pub use capability::{CapabilityDescriptor, CapabilityRegistry, CostTier, SubstitutePolicy};
pub use config::{AgentConfig, BackendConfig, LlmConfig, LlmProvider, RedactionConfig};
pub use decision::{CostEstimate, Decision, StepInvocation};
pub use events::{EventEmitter, RunEvent};
pub use graph::{build_graph, Edge, EdgeKind, ExecutionGraph, Node};
pub use intent::{Hints, Intent, IntentSource, IntentTag};
pub use orchestrator::{CancelHandle, CancelToken, Orchestrator};
pub use payload::{build_run_payload, NodePayload, PayloadInput, PayloadItem, RunPayload};
pub use planner::Planner;
pub use result::{NodeOutcome, RunResult};
pub use retry::{BackoffPolicy, RetryPolicy};
pub use router::{IntentClassifier, LlmClassifier, Router, RoutingRule};
pub use sink::{JsonFileSink, ResultSink};
pub use step::{DynStep, Params, Step};
pub use steps::{default_registry, QueryEngine, QueryOutput};
pub use trace::{NodeTrace, Redactor, TracePhase, Tracer};
pub use validator::{Severity, SuggestedAction, ValidationOutcome, Validator};
