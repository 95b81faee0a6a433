//! The planner's output: an ordered list of step invocations.

use serde::{Deserialize, Serialize};

use crate::capability::CapabilityDescriptor;
use crate::intent::{Hints, IntentTag};
use crate::step::Params;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInvocation {
    pub name: String,
    #[serde(default)]
    pub params: Params,
    /// Descriptor captured at planning time.
    #[serde(skip)]
    pub capability: Option<CapabilityDescriptor>,
}

impl StepInvocation {
    pub fn new(name: impl Into<String>, params: Params) -> Self {
        Self {
            name: name.into(),
            params,
            capability: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub llm_tokens: u64,
    pub scan_bytes_est: u64,
}

/// Serializes as `{intent, confidence, agents, cost_estimate, reason}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub intent: IntentTag,
    pub confidence: f64,
    #[serde(rename = "agents")]
    pub steps: Vec<StepInvocation>,
    pub cost_estimate: CostEstimate,
    #[serde(rename = "reason")]
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Hints::is_empty")]
    pub hints: Hints,
}

impl Decision {
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decision_json_shape() {
        let decision = Decision {
            intent: IntentTag::Summarize,
            confidence: 0.93,
            steps: vec![StepInvocation::new("summarize", Params::new())],
            cost_estimate: CostEstimate {
                llm_tokens: 20,
                scan_bytes_est: 0,
            },
            rationale: "context contains data".into(),
            hints: Hints::default(),
        };
        assert_eq!(
            decision.to_json(),
            json!({
                "intent": "summarize",
                "confidence": 0.93,
                "agents": [{"name": "summarize", "params": {}}],
                "cost_estimate": {"llm_tokens": 20, "scan_bytes_est": 0},
                "reason": "context contains data"
            })
        );
    }

    #[test]
    fn decision_parses_without_hints() {
        let decision: Decision = serde_json::from_value(json!({
            "intent": "sql",
            "confidence": 0.9,
            "agents": [{"name": "generate_sql"}],
            "cost_estimate": {"llm_tokens": 100, "scan_bytes_est": 0},
            "reason": "r"
        }))
        .unwrap();
        assert_eq!(decision.step_names(), vec!["generate_sql"]);
        assert!(decision.steps[0].capability.is_none());
    }
}
