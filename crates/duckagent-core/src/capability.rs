//! Capability descriptors and the registry of step implementations.
//!
//! Every step type is registered by name at process start. The registry is
//! read-only afterwards and shared across concurrent runs behind an `Arc`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use duckagent_types::{AgentError, Result};

use crate::step::{DynStep, Step};

// ---------------------------------------------------------------------------
// CostTier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTier {
    Low,
    Medium,
    High,
}

impl CostTier {
    /// Estimated LLM tokens a step of this tier contributes to a plan.
    pub fn token_estimate(self) -> u64 {
        match self {
            CostTier::Low => 20,
            CostTier::Medium => 100,
            CostTier::High => 400,
        }
    }
}

// ---------------------------------------------------------------------------
// CapabilityDescriptor
// ---------------------------------------------------------------------------

/// Static resource profile of a step type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub requires_query_engine: bool,
    pub can_run_on_sample: bool,
    pub requires_sandbox: bool,
    pub cost_tier: CostTier,
    pub estimated_seconds: f64,
    /// Context keys the step writes on success.
    #[serde(default)]
    pub provides: Vec<String>,
    /// Context keys the step reads when they are present.
    #[serde(default)]
    pub consumes: Vec<String>,
}

impl CapabilityDescriptor {
    pub fn new(cost_tier: CostTier) -> Self {
        Self {
            requires_query_engine: false,
            can_run_on_sample: false,
            requires_sandbox: false,
            cost_tier,
            estimated_seconds: 1.0,
            provides: Vec::new(),
            consumes: Vec::new(),
        }
    }

    pub fn query_engine(mut self) -> Self {
        self.requires_query_engine = true;
        self
    }

    pub fn sample_capable(mut self) -> Self {
        self.can_run_on_sample = true;
        self
    }

    pub fn sandboxed(mut self) -> Self {
        self.requires_sandbox = true;
        self
    }

    pub fn seconds(mut self, estimated_seconds: f64) -> Self {
        self.estimated_seconds = estimated_seconds;
        self
    }

    pub fn provides(mut self, keys: &[&str]) -> Self {
        self.provides = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn consumes(mut self, keys: &[&str]) -> Self {
        self.consumes = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Two steps belong to the same capability class when they need the same
    /// execution environment.
    pub fn same_class(&self, other: &CapabilityDescriptor) -> bool {
        self.requires_query_engine == other.requires_query_engine
            && self.requires_sandbox == other.requires_sandbox
    }
}

// ---------------------------------------------------------------------------
// SubstitutePolicy
// ---------------------------------------------------------------------------

/// Which alternatives a `substitute` validation action may swap in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubstitutePolicy {
    /// Only alternatives of exactly the same cost tier.
    SameTier,
    /// Alternatives of the same or a cheaper tier.
    #[default]
    AllowCheaper,
}

impl SubstitutePolicy {
    fn permits(self, original: CostTier, alternative: CostTier) -> bool {
        match self {
            SubstitutePolicy::SameTier => alternative == original,
            SubstitutePolicy::AllowCheaper => alternative <= original,
        }
    }
}

// ---------------------------------------------------------------------------
// CapabilityRegistry
// ---------------------------------------------------------------------------

pub struct CapabilityRegistry {
    steps: HashMap<String, DynStep>,
    order: Vec<String>,
    substitutes: HashMap<String, Vec<String>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            steps: HashMap::new(),
            order: Vec::new(),
            substitutes: HashMap::new(),
        }
    }

    /// Register a step under its own name. Re-registering a name replaces the
    /// implementation but keeps its original position.
    pub fn register(&mut self, step: impl Step + 'static) {
        self.register_dyn(DynStep::new(step));
    }

    pub fn register_dyn(&mut self, step: DynStep) {
        let name = step.name().to_string();
        if !self.steps.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.steps.insert(name, step);
    }

    /// Declare `alternative` as a safer stand-in for `original`.
    /// Candidates are tried in declaration order. A declaration that would
    /// let a step substitute for itself, directly or through a chain, is
    /// rejected.
    pub fn register_substitute(&mut self, original: &str, alternative: &str) -> Result<()> {
        if original == alternative || self.substitutes_reach(alternative, original) {
            return Err(AgentError::Config(format!(
                "substitute '{alternative}' for '{original}' would form a cycle"
            )));
        }
        let alternatives = self.substitutes.entry(original.to_string()).or_default();
        if !alternatives.iter().any(|a| a == alternative) {
            alternatives.push(alternative.to_string());
        }
        Ok(())
    }

    /// Whether `to` can be reached from `from` by following substitute declarations.
    fn substitutes_reach(&self, from: &str, to: &str) -> bool {
        let mut pending = vec![from];
        let mut seen: Vec<&str> = Vec::new();
        while let Some(name) = pending.pop() {
            if name == to {
                return true;
            }
            if seen.contains(&name) {
                continue;
            }
            seen.push(name);
            if let Some(alternatives) = self.substitutes.get(name) {
                pending.extend(alternatives.iter().map(String::as_str));
            }
        }
        false
    }

    pub fn get(&self, name: &str) -> Option<&DynStep> {
        self.steps.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn descriptor(&self, name: &str) -> Option<CapabilityDescriptor> {
        self.steps.get(name).map(|s| s.describe())
    }

    /// Step names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// First registered alternative for `name` that is in the same capability
    /// class, allowed by `policy`, and not among the `tried` steps.
    pub fn substitute_for(
        &self,
        name: &str,
        policy: SubstitutePolicy,
        tried: &[String],
    ) -> Option<&str> {
        let original = self.descriptor(name)?;
        self.substitutes.get(name)?.iter().find_map(|alt| {
            if tried.iter().any(|t| t == alt) {
                return None;
            }
            let candidate = self.descriptor(alt)?;
            (candidate.same_class(&original)
                && policy.permits(original.cost_tier, candidate.cost_tier))
            .then_some(alt.as_str())
        })
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
