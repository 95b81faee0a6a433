//! The `Agent` facade: one call from prompt to [`RunResult`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use duckagent_llm::DynModel;
use duckagent_types::{Result, RunContext};

use crate::backend::{BackendSelector, HostedClient};
use crate::capability::CapabilityRegistry;
use crate::config::AgentConfig;
use crate::decision::Decision;
use crate::events::EventEmitter;
use crate::graph::build_graph;
use crate::intent::Intent;
use crate::orchestrator::{CancelToken, Orchestrator};
use crate::planner::Planner;
use crate::result::RunResult;
use crate::router::{IntentClassifier, LlmClassifier, Router};
use crate::step::{DynStep, Step};
use crate::steps::{default_registry, QueryEngine};

/// Per-call inputs besides the prompt.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Forced intent; skips classification.
    pub mode: Option<String>,
    /// Initial context values.
    pub context: HashMap<String, Value>,
    /// Explicit dataset, stored as `full_df` over anything in `context`.
    pub data: Option<Value>,
    pub table_name: Option<String>,
}

impl RunOptions {
    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentResponse {
    pub intent: Intent,
    pub decision: Option<Decision>,
    pub result: RunResult,
}

pub struct Agent {
    registry: Arc<CapabilityRegistry>,
    router: Router,
    planner: Planner,
    orchestrator: Orchestrator,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventEmitter {
        self.orchestrator.events()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub async fn run(&self, prompt: &str, options: RunOptions) -> AgentResponse {
        self.run_with_cancel(prompt, options, CancelToken::never())
            .await
    }

    /// Route, plan, build and execute. Planning and graph errors come back
    /// as a failed [`RunResult`].
    pub async fn run_with_cancel(
        &self,
        prompt: &str,
        options: RunOptions,
        cancel: CancelToken,
    ) -> AgentResponse {
        let mode = options.mode.clone();
        let context = Self::context_for(prompt, options).await;
        let intent = self
            .router
            .detect_intent(prompt, mode.as_deref(), &context)
            .await;

        let decision = match self.planner.plan_for_intent(&intent, prompt, &context).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(intent = %intent.tag, error = %e, "Planning failed");
                return AgentResponse {
                    intent,
                    decision: None,
                    result: RunResult::rejected(e.to_string()),
                };
            }
        };

        let graph = match build_graph(&decision, &self.registry) {
            Ok(graph) => graph,
            Err(e) => {
                tracing::warn!(error = %e, "Graph construction failed");
                return AgentResponse {
                    intent,
                    decision: Some(decision),
                    result: RunResult::rejected(e.to_string()),
                };
            }
        };

        let result = self
            .orchestrator
            .execute_with_cancel(graph, &context, cancel)
            .await;
        AgentResponse {
            intent,
            decision: Some(decision),
            result,
        }
    }

    /// Route and plan without executing.
    pub async fn plan(&self, prompt: &str, options: RunOptions) -> Result<(Intent, Decision)> {
        let mode = options.mode.clone();
        let context = Self::context_for(prompt, options).await;
        let intent = self
            .router
            .detect_intent(prompt, mode.as_deref(), &context)
            .await;
        let decision = self.planner.plan_for_intent(&intent, prompt, &context).await?;
        Ok((intent, decision))
    }

    async fn context_for(prompt: &str, options: RunOptions) -> RunContext {
        let context = RunContext::from_values(options.context);
        context.set("prompt", json!(prompt)).await;
        if let Some(data) = options.data {
            context.set("full_df", data).await;
        }
        if let Some(name) = options.table_name {
            context.set("full_df_table_name", json!(name)).await;
        }
        context
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct AgentBuilder {
    config: AgentConfig,
    model: Option<DynModel>,
    engine: Option<Arc<dyn QueryEngine>>,
    hosted: Option<Arc<dyn HostedClient>>,
    selector: Option<BackendSelector>,
    classifier: Option<Arc<dyn IntentClassifier>>,
    steps: Vec<DynStep>,
    substitutes: Vec<(String, String)>,
    events: Option<EventEmitter>,
}

impl AgentBuilder {
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Model used for SQL generation, summaries, classification and planning.
    pub fn model(mut self, model: DynModel) -> Self {
        self.model = Some(model);
        self
    }

    pub fn query_engine(mut self, engine: Arc<dyn QueryEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn hosted_client(mut self, client: Arc<dyn HostedClient>) -> Self {
        self.hosted = Some(client);
        self
    }

    /// Replace the configured backend list outright.
    pub fn backends(mut self, selector: BackendSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Register an extra step, replacing any reference step of the same name.
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(DynStep::new(step));
        self
    }

    pub fn substitute(mut self, original: &str, alternative: &str) -> Self {
        self.substitutes
            .push((original.to_string(), alternative.to_string()));
        self
    }

    pub fn events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<Agent> {
        self.config.validate()?;

        let mut registry = default_registry(self.model.clone(), self.engine);
        for step in self.steps {
            registry.register_dyn(step);
        }
        for (original, alternative) in &self.substitutes {
            registry.register_substitute(original, alternative)?;
        }
        let registry = Arc::new(registry);

        let mut router = Router::new(self.config.confidence_threshold)?;
        let classifier = self.classifier.or_else(|| {
            self.model
                .clone()
                .map(|m| Arc::new(LlmClassifier::new(m)) as Arc<dyn IntentClassifier>)
        });
        if let Some(classifier) = classifier {
            router = router.with_classifier(classifier);
        }

        let mut planner = Planner::new(Arc::clone(&registry), &self.config);
        if let Some(model) = self.model {
            planner = planner.with_model(model);
        }

        let selector = self
            .selector
            .unwrap_or_else(|| BackendSelector::from_config(&self.config.backends, self.hosted));
        let mut orchestrator =
            Orchestrator::new(Arc::clone(&registry), &self.config)?.with_selector(selector);
        if let Some(events) = self.events {
            orchestrator = orchestrator.with_events(events);
        }

        tracing::debug!(steps = registry.len(), "Agent built");
        Ok(Agent {
            registry,
            router,
            planner,
            orchestrator,
        })
    }
}
