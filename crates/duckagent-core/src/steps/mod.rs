//! Reference step set and the query-engine seam.

pub mod analysis;
pub mod sql;
pub mod summarize;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use duckagent_llm::DynModel;
use duckagent_types::Result;

use crate::capability::CapabilityRegistry;

pub use analysis::{Analyze, DescribeStats};
pub use sql::{ExecuteSql, GenerateSql, ValidateSql};
pub use summarize::Summarize;

// ---------------------------------------------------------------------------
// QueryEngine
// ---------------------------------------------------------------------------

/// Rows returned by a [`QueryEngine`]. Each row is a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Value>,
    /// Total matching rows when the engine knows it; may exceed `rows.len()`.
    pub total_rows: Option<u64>,
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn query(&self, sql: &str, max_rows: u64) -> Result<QueryOutput>;
}

// ---------------------------------------------------------------------------
// Dataset helpers
// ---------------------------------------------------------------------------

/// Rows available in the context: `full_df` (an array, or an object with a
/// `rows` array) wins over a non-empty `rows_preview`.
pub fn dataset_rows(values: &HashMap<String, Value>) -> Option<&Vec<Value>> {
    let from_full = values.get("full_df").and_then(|v| match v {
        Value::Array(rows) => Some(rows),
        Value::Object(obj) => obj.get("rows").and_then(Value::as_array),
        _ => None,
    });
    from_full.or_else(|| {
        values
            .get("rows_preview")
            .and_then(Value::as_array)
            .filter(|rows| !rows.is_empty())
    })
}

/// Whether the context already carries a dataset the run can use directly.
pub fn has_dataset(values: &HashMap<String, Value>) -> bool {
    values.get("full_df").is_some_and(|v| !v.is_null())
        || values
            .get("rows_preview")
            .and_then(Value::as_array)
            .is_some_and(|rows| !rows.is_empty())
        || values
            .get("full_df_table_name")
            .and_then(Value::as_str)
            .is_some_and(|name| !name.is_empty())
}

/// Row count reported by earlier structured output, falling back to the
/// number of rows materialized in the context.
pub fn expected_row_count(values: &HashMap<String, Value>) -> Option<u64> {
    values
        .get("row_count")
        .and_then(Value::as_u64)
        .or_else(|| dataset_rows(values).map(|rows| rows.len() as u64))
}

/// Column names across `rows`, in first-seen order.
pub fn column_names(rows: &[Value]) -> Vec<String> {
    let mut cols: Vec<String> = Vec::new();
    for row in rows {
        if let Some(obj) = row.as_object() {
            for key in obj.keys() {
                if !cols.iter().any(|c| c == key) {
                    cols.push(key.clone());
                }
            }
        }
    }
    cols
}

/// Table names listed in the context `tables` catalog (array of names or an
/// object keyed by name), lower-cased.
pub fn catalog_tables(values: &HashMap<String, Value>) -> Option<Vec<String>> {
    match values.get("tables")? {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_lowercase)
                .collect(),
        ),
        Value::Object(obj) => Some(obj.keys().map(|k| k.to_lowercase()).collect()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Default registry
// ---------------------------------------------------------------------------

/// Registry holding the reference steps, with `execute_sql_sample` declared as
/// the substitute for `execute_sql` and `describe_stats` for `analyze`.
pub fn default_registry(
    model: Option<DynModel>,
    engine: Option<Arc<dyn QueryEngine>>,
) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register(GenerateSql::new(model.clone()));
    registry.register(ValidateSql);
    registry.register(ExecuteSql::full(engine.clone()));
    registry.register(ExecuteSql::sample(engine));
    registry.register(Analyze);
    registry.register(DescribeStats);
    registry.register(Summarize::new(model));

    for (original, alternative) in [
        ("execute_sql", "execute_sql_sample"),
        ("analyze", "describe_stats"),
    ] {
        if let Err(e) = registry.register_substitute(original, alternative) {
            tracing::warn!(original, alternative, error = %e, "Substitute not registered");
        }
    }
    registry
}
