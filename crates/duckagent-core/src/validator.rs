//! Pre- and post-execution gates for graph nodes.
//!
//! Both checks are pure: they read the node, its output, and a context
//! snapshot, and return a [`ValidationOutcome`]. Outputs are never modified.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use duckagent_types::{AgentError, Result};

use crate::capability::CostTier;
use crate::config::AgentConfig;
use crate::graph::Node;
use crate::sqltext;
use crate::step::{param_str, param_u64};
use crate::steps::{catalog_tables, expected_row_count};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warn,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    RetrySample,
    Substitute,
    Escalate,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub passed: bool,
    pub severity: Severity,
    pub reason: String,
    pub suggested_action: SuggestedAction,
}

impl ValidationOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            severity: Severity::Warn,
            reason: String::new(),
            suggested_action: SuggestedAction::None,
        }
    }

    /// Passing outcome that still carries a warning.
    pub fn warn(reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            severity: Severity::Warn,
            reason: reason.into(),
            suggested_action: SuggestedAction::None,
        }
    }

    pub fn fail(reason: impl Into<String>, action: SuggestedAction) -> Self {
        Self {
            passed: false,
            severity: Severity::Fail,
            reason: reason.into(),
            suggested_action: action,
        }
    }

    pub fn is_warning(&self) -> bool {
        self.passed && !self.reason.is_empty()
    }
}

pub struct Validator {
    max_scan_bytes: u64,
    max_cost_tier: CostTier,
    min_non_null_rate: f64,
    default_max_rows: u64,
    row_bytes: u64,
    row_claim: Regex,
}

impl Validator {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let row_claim = Regex::new(r"(?i)\b(\d[\d,]*)\s+rows?\b")
            .map_err(|e| AgentError::Config(format!("row-claim pattern: {e}")))?;
        Ok(Self {
            max_scan_bytes: config.max_scan_bytes,
            max_cost_tier: config.max_cost_tier,
            min_non_null_rate: config.min_non_null_rate,
            default_max_rows: config.default_max_rows,
            row_bytes: config.row_bytes_estimate,
            row_claim,
        })
    }

    /// SQL the node would run: its own `sql` param, else the context `sql`
    /// for steps that consume it.
    fn node_sql<'a>(node: &'a Node, context: &'a HashMap<String, Value>) -> Option<&'a str> {
        param_str(&node.invocation.params, "sql").or_else(|| {
            node.capability
                .consumes
                .iter()
                .any(|k| k == "sql")
                .then(|| context.get("sql").and_then(Value::as_str))
                .flatten()
        })
    }

    pub fn pre_check(&self, node: &Node, context: &HashMap<String, Value>) -> ValidationOutcome {
        let params = &node.invocation.params;
        let sql = Self::node_sql(node, context);

        if let Some(kw) = sql.and_then(sqltext::destructive_keyword) {
            let confirmed = context
                .get("confirm_destructive")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !confirmed {
                return ValidationOutcome::fail(
                    format!("destructive statement ({kw}) requires confirm_destructive"),
                    SuggestedAction::Escalate,
                );
            }
        }

        let requested = param_u64(params, "max_rows");
        if let (Some(requested), Some(limit)) = (requested, node.hints.max_rows) {
            if requested > limit {
                return ValidationOutcome::fail(
                    format!("requested {requested} rows exceeds the limit of {limit}"),
                    SuggestedAction::RetrySample,
                );
            }
        }

        if node.capability.requires_query_engine {
            let rows = requested.unwrap_or(self.default_max_rows);
            let estimate = rows.saturating_mul(self.row_bytes);
            if estimate > self.max_scan_bytes {
                let action = if node.capability.can_run_on_sample {
                    SuggestedAction::RetrySample
                } else {
                    SuggestedAction::Substitute
                };
                return ValidationOutcome::fail(
                    format!(
                        "estimated scan of {estimate} bytes exceeds budget of {} bytes",
                        self.max_scan_bytes
                    ),
                    action,
                );
            }
        }

        if node.capability.cost_tier > self.max_cost_tier {
            return ValidationOutcome::fail(
                format!(
                    "cost tier {:?} is above the ceiling {:?}",
                    node.capability.cost_tier, self.max_cost_tier
                ),
                SuggestedAction::Substitute,
            );
        }

        if let Some(catalog) = catalog_tables(context) {
            let mut referenced: Vec<String> = sql.map(sqltext::referenced_tables).unwrap_or_default();
            if let Some(table) = param_str(params, "table") {
                referenced.push(table.to_lowercase());
            }
            if let Some(missing) = referenced.iter().find(|t| !catalog.contains(t)) {
                return ValidationOutcome::fail(
                    format!("table '{missing}' is not in the catalog"),
                    SuggestedAction::Escalate,
                );
            }
        }

        if node.hints.sample_only && !node.capability.can_run_on_sample {
            return ValidationOutcome::warn(format!(
                "sample-only run but '{}' cannot run on a sample",
                node.step()
            ));
        }

        ValidationOutcome::pass()
    }

    pub fn post_check(
        &self,
        node: &Node,
        output: &Value,
        context: &HashMap<String, Value>,
    ) -> ValidationOutcome {
        if output.is_null() {
            return ValidationOutcome::fail("step returned no output", SuggestedAction::RetrySample);
        }

        if let Some(err) = output.get("error").filter(|e| !e.is_null()) {
            let text = err.as_str().map_or_else(|| err.to_string(), String::from);
            return ValidationOutcome::fail(
                format!("step reported an error: {text}"),
                SuggestedAction::RetrySample,
            );
        }

        if output.get("valid").and_then(Value::as_bool) == Some(false) {
            let issues = output
                .get("issues")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join("; ")
                })
                .unwrap_or_default();
            return ValidationOutcome::fail(
                format!("validation rejected the input: {issues}"),
                SuggestedAction::Escalate,
            );
        }

        if output
            .get("rows_affected")
            .and_then(Value::as_u64)
            .is_some_and(|n| n > 0)
        {
            return ValidationOutcome::fail(
                format!("read-only step '{}' reported mutations", node.step()),
                SuggestedAction::Escalate,
            );
        }

        let rows = output.get("rows_preview").and_then(Value::as_array);

        if let Some(expected) = node
            .invocation
            .params
            .get("expected_columns")
            .and_then(Value::as_array)
        {
            let present: Vec<String> = match output.get("columns").and_then(Value::as_array) {
                Some(cols) => cols.iter().filter_map(Value::as_str).map(String::from).collect(),
                None => rows
                    .and_then(|r| r.first())
                    .and_then(Value::as_object)
                    .map(|o| o.keys().cloned().collect())
                    .unwrap_or_default(),
            };
            let missing: Vec<&str> = expected
                .iter()
                .filter_map(Value::as_str)
                .filter(|c| !present.iter().any(|p| p == c))
                .collect();
            if !missing.is_empty() {
                return ValidationOutcome::fail(
                    format!("missing expected columns: {}", missing.join(", ")),
                    SuggestedAction::RetrySample,
                );
            }
        }

        if let Some(rate) = rows.and_then(|r| non_null_rate(r)) {
            if rate < self.min_non_null_rate {
                return ValidationOutcome::warn(format!(
                    "non-null rate {rate:.2} is below {:.2}",
                    self.min_non_null_rate
                ));
            }
        }

        if let Some(summary) = output.get("summary") {
            let text = summary.as_str().unwrap_or("");
            if text.trim().is_empty() {
                return ValidationOutcome::fail("summary is empty", SuggestedAction::RetrySample);
            }
            if let Some(outcome) = self.check_row_claims(text, context) {
                return outcome;
            }
        }

        ValidationOutcome::pass()
    }

    fn check_row_claims(&self, text: &str, context: &HashMap<String, Value>) -> Option<ValidationOutcome> {
        let expected = expected_row_count(context)?;
        self.row_claim.captures_iter(text).find_map(|caps| {
            let claimed: u64 = caps.get(1)?.as_str().replace(',', "").parse().ok()?;
            (claimed != expected).then(|| {
                ValidationOutcome::warn(format!(
                    "summary claims {claimed} rows but the data has {expected}"
                ))
            })
        })
    }
}

/// Share of non-null cells across the row objects.
fn non_null_rate(rows: &[Value]) -> Option<f64> {
    let (total, filled) = rows
        .iter()
        .filter_map(Value::as_object)
        .flat_map(|o| o.values())
        .fold((0u64, 0u64), |(t, f), v| (t + 1, f + u64::from(!v.is_null())));
    (total > 0).then(|| filled as f64 / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{CostEstimate, Decision, StepInvocation};
    use crate::graph::build_graph;
    use crate::intent::{Hints, IntentTag};
    use crate::steps::default_registry;
    use serde_json::json;

    fn node_with(step: &str, params: Value, hints: Hints) -> Node {
        let reg = default_registry(None, None);
        let decision = Decision {
            intent: IntentTag::Sql,
            confidence: 0.9,
            steps: vec![StepInvocation::new(
                step,
                params.as_object().cloned().unwrap_or_default(),
            )],
            cost_estimate: CostEstimate::default(),
            rationale: String::new(),
            hints,
        };
        let graph = build_graph(&decision, &reg).unwrap();
        let node = graph.nodes().next().unwrap().clone();
        node
    }

    fn node(step: &str) -> Node {
        node_with(step, json!({}), Hints::default())
    }

    fn ctx(v: Value) -> HashMap<String, Value> {
        serde_json::from_value(v).unwrap()
    }

    fn validator() -> Validator {
        Validator::new(&AgentConfig::default()).unwrap()
    }

    #[test]
    fn pre_check_passes_plain_select() {
        let outcome = validator().pre_check(
            &node("execute_sql"),
            &ctx(json!({"sql": "SELECT * FROM t LIMIT 10"})),
        );
        assert_eq!(outcome, ValidationOutcome::pass());
    }

    #[test]
    fn destructive_sql_escalates_unless_confirmed() {
        let v = validator();
        let n = node("execute_sql");
        let outcome = v.pre_check(&n, &ctx(json!({"sql": "DROP TABLE users"})));
        assert!(!outcome.passed);
        assert_eq!(outcome.suggested_action, SuggestedAction::Escalate);

        let confirmed = v.pre_check(
            &n,
            &ctx(json!({"sql": "DROP TABLE users", "confirm_destructive": true})),
        );
        assert!(confirmed.passed);
    }

    #[test]
    fn row_limit_above_hint_retries_on_sample() {
        let n = node_with(
            "execute_sql",
            json!({"max_rows": 5000}),
            Hints {
                max_rows: Some(100),
                ..Hints::default()
            },
        );
        let outcome = validator().pre_check(&n, &ctx(json!({"sql": "SELECT 1"})));
        assert_eq!(outcome.suggested_action, SuggestedAction::RetrySample);
    }

    #[test]
    fn scan_budget_respects_sample_capability() {
        let config = AgentConfig {
            max_scan_bytes: 1024,
            ..AgentConfig::default()
        };
        let v = Validator::new(&config).unwrap();
        let outcome = v.pre_check(
            &node_with("execute_sql", json!({"max_rows": 1000}), Hints::default()),
            &ctx(json!({"sql": "SELECT 1"})),
        );
        assert_eq!(outcome.suggested_action, SuggestedAction::RetrySample);
    }

    #[test]
    fn cost_ceiling_suggests_substitute() {
        let config = AgentConfig {
            max_cost_tier: CostTier::Medium,
            ..AgentConfig::default()
        };
        let v = Validator::new(&config).unwrap();
        let outcome = v.pre_check(&node("analyze"), &ctx(json!({})));
        assert_eq!(outcome.suggested_action, SuggestedAction::Substitute);
    }

    #[test]
    fn unknown_table_escalates() {
        let outcome = validator().pre_check(
            &node("execute_sql"),
            &ctx(json!({"sql": "SELECT * FROM secrets", "tables": ["sales"]})),
        );
        assert_eq!(outcome.suggested_action, SuggestedAction::Escalate);
        assert!(outcome.reason.contains("secrets"));
    }

    #[test]
    fn sample_only_on_incapable_step_warns() {
        let n = node_with(
            "analyze",
            json!({}),
            Hints {
                sample_only: true,
                ..Hints::default()
            },
        );
        let outcome = validator().pre_check(&n, &ctx(json!({})));
        assert!(outcome.passed);
        assert!(outcome.is_warning());
    }

    #[test]
    fn post_check_null_and_error_retry() {
        let v = validator();
        let n = node("execute_sql");
        assert_eq!(
            v.post_check(&n, &Value::Null, &ctx(json!({}))).suggested_action,
            SuggestedAction::RetrySample
        );
        assert_eq!(
            v.post_check(&n, &json!({"error": "boom"}), &ctx(json!({})))
                .suggested_action,
            SuggestedAction::RetrySample
        );
    }

    #[test]
    fn post_check_invalid_escalates() {
        let outcome = validator().post_check(
            &node("validate_sql"),
            &json!({"valid": false, "issues": ["statement is not read-only (DROP)"]}),
            &ctx(json!({})),
        );
        assert_eq!(outcome.suggested_action, SuggestedAction::Escalate);
        assert!(outcome.reason.contains("DROP"));
    }

    #[test]
    fn post_check_mutation_escalates() {
        let outcome = validator().post_check(
            &node("execute_sql"),
            &json!({"rows_preview": [], "rows_affected": 3}),
            &ctx(json!({})),
        );
        assert_eq!(outcome.suggested_action, SuggestedAction::Escalate);
    }

    #[test]
    fn post_check_missing_columns() {
        let n = node_with(
            "execute_sql",
            json!({"expected_columns": ["country", "revenue"]}),
            Hints::default(),
        );
        let outcome = validator().post_check(
            &n,
            &json!({"rows_preview": [{"country": "DE"}]}),
            &ctx(json!({})),
        );
        assert_eq!(outcome.suggested_action, SuggestedAction::RetrySample);
        assert!(outcome.reason.contains("revenue"));
    }

    #[test]
    fn post_check_low_non_null_rate_warns() {
        let outcome = validator().post_check(
            &node("execute_sql"),
            &json!({"rows_preview": [{"a": null, "b": null}, {"a": 1, "b": null}]}),
            &ctx(json!({})),
        );
        assert!(outcome.passed);
        assert!(outcome.reason.contains("non-null rate"));
    }

    #[test]
    fn post_check_empty_summary_retries() {
        let outcome = validator().post_check(
            &node("summarize"),
            &json!({"summary": "  "}),
            &ctx(json!({})),
        );
        assert_eq!(outcome.suggested_action, SuggestedAction::RetrySample);
    }

    #[test]
    fn post_check_flags_row_count_mismatch_without_changing_output() {
        let output = json!({"summary": "The table has 1,200 rows."});
        let before = output.clone();
        let outcome = validator().post_check(
            &node("summarize"),
            &output,
            &ctx(json!({"row_count": 1000})),
        );
        assert!(outcome.passed);
        assert!(outcome.reason.contains("1200"));
        assert_eq!(output, before);

        let consistent = validator().post_check(
            &node("summarize"),
            &json!({"summary": "Dataset with 1000 rows."}),
            &ctx(json!({"row_count": 1000})),
        );
        assert_eq!(consistent, ValidationOutcome::pass());
    }

    #[test]
    fn non_null_rate_of_empty_rows_is_none() {
        assert_eq!(non_null_rate(&[]), None);
    }
}
