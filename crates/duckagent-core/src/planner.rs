//! Expands an intent into an ordered, cost-annotated [`Decision`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Value};

use duckagent_llm::DynModel;
use duckagent_types::{AgentError, Result, RunContext};

use crate::capability::{CapabilityDescriptor, CapabilityRegistry};
use crate::config::AgentConfig;
use crate::decision::{CostEstimate, Decision, StepInvocation};
use crate::intent::{Hints, Intent, IntentTag};
use crate::step::{param_u64, Params};
use crate::steps::has_dataset;

pub struct Planner {
    registry: Arc<CapabilityRegistry>,
    model: Option<DynModel>,
    sequences: HashMap<String, Vec<String>>,
    sample_rows: u64,
    default_max_rows: u64,
    row_bytes: u64,
}

impl Planner {
    pub fn new(registry: Arc<CapabilityRegistry>, config: &AgentConfig) -> Self {
        Self {
            registry,
            model: None,
            sequences: config.sequences.clone(),
            sample_rows: config.sample_rows,
            default_max_rows: config.default_max_rows,
            row_bytes: config.row_bytes_estimate,
        }
    }

    /// Model consulted for intents without a known step sequence.
    pub fn with_model(mut self, model: DynModel) -> Self {
        self.model = Some(model);
        self
    }

    pub async fn plan_for_intent(
        &self,
        intent: &Intent,
        prompt: &str,
        context: &RunContext,
    ) -> Result<Decision> {
        let snapshot = context.snapshot().await;

        if !intent.is_forced() && has_dataset(&snapshot) {
            let hints = Hints {
                use_existing_data: true,
                ..intent.hints.clone()
            };
            let mut params = Params::new();
            params.insert("use_existing_data".into(), Value::Bool(true));
            let steps = self.resolve(vec![("summarize".to_string(), params)]);
            tracing::info!(intent = %intent.tag, "Dataset present, planning summary only");
            return Ok(self.decision(
                intent,
                hints,
                steps,
                "context already contains data; summarizing it directly".into(),
            ));
        }

        let hints = self.effective_hints(intent);
        let names = self.sequence_for(&intent.tag, prompt).await?;
        let planned: Vec<(String, Params)> = names
            .into_iter()
            .map(|name| {
                let params = self.scope_params(&name, &hints);
                (name, params)
            })
            .collect();

        let resolved = self.resolve(planned);
        let (kept, dropped) = self.prune(resolved, &snapshot);
        if kept.is_empty() {
            return Err(AgentError::Planning {
                intent: intent.tag.to_string(),
                message: "every planned step was already satisfied".into(),
            });
        }

        let mut rationale = format!(
            "intent {} ({:.2}): {}",
            intent.tag,
            intent.confidence,
            kept.iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        if !dropped.is_empty() {
            rationale.push_str(&format!(
                "; skipped {} (outputs already in context)",
                dropped.join(", ")
            ));
        }
        if hints.sample_only {
            rationale.push_str("; sample scope");
        }

        let decision = self.decision(intent, hints, kept, rationale);
        tracing::info!(
            intent = %decision.intent,
            steps = decision.steps.len(),
            llm_tokens = decision.cost_estimate.llm_tokens,
            scan_bytes = decision.cost_estimate.scan_bytes_est,
            "Plan ready"
        );
        Ok(decision)
    }

    fn effective_hints(&self, intent: &Intent) -> Hints {
        let mut hints = intent.hints.clone();
        if intent.tag == IntentTag::Explore && !hints.confirm_full_run {
            hints.sample_only = true;
            hints.max_rows = Some(
                hints
                    .max_rows
                    .map_or(self.sample_rows, |r| r.min(self.sample_rows)),
            );
        }
        hints
    }

    async fn sequence_for(&self, tag: &IntentTag, prompt: &str) -> Result<Vec<String>> {
        let canonical: &[&str] = match tag {
            IntentTag::Analyze => &[
                "generate_sql",
                "validate_sql",
                "execute_sql",
                "analyze",
                "summarize",
            ],
            IntentTag::Sql | IntentTag::Explore => {
                &["generate_sql", "validate_sql", "execute_sql", "summarize"]
            }
            IntentTag::Summarize => &["summarize"],
            IntentTag::Other(_) => &[],
        };
        if !canonical.is_empty() {
            return Ok(canonical.iter().map(|s| s.to_string()).collect());
        }
        if let Some(sequence) = self.sequences.get(tag.as_str()) {
            return Ok(sequence.clone());
        }
        self.expand_with_model(tag, prompt).await
    }

    async fn expand_with_model(&self, tag: &IntentTag, prompt: &str) -> Result<Vec<String>> {
        let planning_error = |message: String| AgentError::Planning {
            intent: tag.to_string(),
            message,
        };
        let Some(model) = &self.model else {
            return Err(planning_error(
                "no step sequence is known and no planning model is configured".into(),
            ));
        };

        let catalog: Vec<String> = self
            .registry
            .names()
            .filter_map(|n| {
                self.registry
                    .descriptor(n)
                    .map(|d| format!("- {n}: cost {:?}, provides {:?}", d.cost_tier, d.provides))
            })
            .collect();
        let request = format!(
            "Choose an ordered list of steps for the '{tag}' request below.\n\
             Available steps:\n{}\n\
             Answer with a JSON array of step names only.\n\nRequest: {prompt}",
            catalog.join("\n")
        );
        let text = model
            .generate(&request, 128)
            .await
            .map_err(|e| planning_error(format!("planning model failed: {e}")))?;

        let (Some(start), Some(end)) = (text.find('['), text.rfind(']')) else {
            return Err(planning_error(format!("planning model answer is not a list: {text}")));
        };
        let names: Vec<String> = serde_json::from_str(&text[start..=end])
            .map_err(|e| planning_error(format!("planning model answer is malformed: {e}")))?;
        let known: Vec<String> = names
            .into_iter()
            .filter(|n| self.registry.has(n))
            .collect();
        if known.is_empty() {
            return Err(planning_error("planning model proposed no registered steps".into()));
        }
        Ok(known)
    }

    /// Row-limit and sample parameters for a step, derived from the hints.
    fn scope_params(&self, name: &str, hints: &Hints) -> Params {
        let mut params = Params::new();
        let Some(descriptor) = self.registry.descriptor(name) else {
            return params;
        };
        let scoped = descriptor.requires_query_engine || descriptor.provides.iter().any(|p| p == "sql");
        if scoped {
            let limit = hints.max_rows.unwrap_or(self.default_max_rows);
            params.insert("max_rows".into(), json!(limit));
        }
        if hints.sample_only && descriptor.can_run_on_sample {
            params.insert("sample_only".into(), Value::Bool(true));
        }
        if name == "analyze" {
            params.insert("analysis_mode".into(), json!("descriptive"));
        }
        params
    }

    fn resolve(&self, planned: Vec<(String, Params)>) -> Vec<StepInvocation> {
        planned
            .into_iter()
            .map(|(name, params)| {
                let capability = self.registry.descriptor(&name);
                StepInvocation {
                    name,
                    params,
                    capability,
                }
            })
            .collect()
    }

    /// Walk the sequence backwards, keeping the final step plus every step
    /// whose outputs a kept step consumes and the context does not already
    /// hold.
    fn prune(
        &self,
        steps: Vec<StepInvocation>,
        snapshot: &HashMap<String, Value>,
    ) -> (Vec<StepInvocation>, Vec<String>) {
        let mut available: HashSet<String> = snapshot
            .iter()
            .filter(|(_, v)| !v.is_null() && !v.as_array().is_some_and(|a| a.is_empty()))
            .map(|(k, _)| k.clone())
            .collect();
        if has_dataset(snapshot) {
            available.insert("rows_preview".into());
        }

        let last = steps.len().saturating_sub(1);
        let mut needed: HashSet<String> = HashSet::new();
        let mut keep = vec![false; steps.len()];
        for (i, step) in steps.iter().enumerate().rev() {
            let Some(d) = &step.capability else {
                keep[i] = true;
                continue;
            };
            let satisfied = !d.provides.is_empty() && d.provides.iter().all(|k| available.contains(k));
            let wanted = i == last || d.provides.iter().any(|k| needed.contains(k));
            if wanted && (!satisfied || i == last) {
                keep[i] = true;
                needed.extend(d.consumes.iter().cloned());
            }
        }

        let mut kept = Vec::new();
        let mut dropped = Vec::new();
        for (step, keep) in steps.into_iter().zip(keep) {
            if keep {
                kept.push(step);
            } else {
                tracing::debug!(step = %step.name, "Dropping step, outputs not needed");
                dropped.push(step.name);
            }
        }
        (kept, dropped)
    }

    fn estimate(&self, steps: &[StepInvocation]) -> CostEstimate {
        steps.iter().fold(CostEstimate::default(), |mut acc, step| {
            if let Some(d) = &step.capability {
                acc.llm_tokens += d.cost_tier.token_estimate();
                acc.scan_bytes_est += self.scan_bytes(d, &step.params);
            }
            acc
        })
    }

    fn scan_bytes(&self, descriptor: &CapabilityDescriptor, params: &Params) -> u64 {
        if !descriptor.requires_query_engine {
            return 0;
        }
        let rows = param_u64(params, "max_rows").unwrap_or(self.default_max_rows);
        rows.saturating_mul(self.row_bytes)
    }

    fn decision(
        &self,
        intent: &Intent,
        hints: Hints,
        steps: Vec<StepInvocation>,
        rationale: String,
    ) -> Decision {
        Decision {
            intent: intent.tag.clone(),
            confidence: intent.confidence,
            cost_estimate: self.estimate(&steps),
            steps,
            rationale,
            hints,
        }
    }
}
