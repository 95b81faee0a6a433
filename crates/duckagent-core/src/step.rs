//! Step trait and its shareable wrapper.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use duckagent_types::{Result, RunContext};

use crate::capability::CapabilityDescriptor;

/// Parameters passed to a step invocation.
pub type Params = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Step trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Step: Send + Sync {
    /// Registry name, e.g. `"generate_sql"`.
    fn name(&self) -> &str;

    fn describe(&self) -> CapabilityDescriptor;

    /// Run the step. The output should be a JSON object; its top-level keys
    /// are merged into the run context once the output passes validation.
    async fn invoke(&self, params: &Params, context: &RunContext) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// DynStep
// ---------------------------------------------------------------------------

/// Cloneable handle so a step can be moved onto a spawned task.
#[derive(Clone)]
pub struct DynStep(Arc<dyn Step>);

impl DynStep {
    pub fn new(step: impl Step + 'static) -> Self {
        Self(Arc::new(step))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn describe(&self) -> CapabilityDescriptor {
        self.0.describe()
    }

    pub async fn invoke(&self, params: &Params, context: &RunContext) -> Result<Value> {
        self.0.invoke(params, context).await
    }
}

impl std::fmt::Debug for DynStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DynStep").field(&self.0.name()).finish()
    }
}

// ---------------------------------------------------------------------------
// Parameter helpers
// ---------------------------------------------------------------------------

pub fn param_u64(params: &Params, key: &str) -> Option<u64> {
    params.get(key).and_then(Value::as_u64)
}

pub fn param_bool(params: &Params, key: &str) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(false)
}

pub fn param_str<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

/// Copy of `params` narrowed to sample scope: `sample_only` set and
/// `max_rows` capped at `sample_rows`.
pub fn sample_params(params: &Params, sample_rows: u64) -> Params {
    let mut narrowed = params.clone();
    let rows = param_u64(params, "max_rows").map_or(sample_rows, |r| r.min(sample_rows));
    narrowed.insert("sample_only".into(), Value::Bool(true));
    narrowed.insert("max_rows".into(), Value::from(rows));
    narrowed
}
