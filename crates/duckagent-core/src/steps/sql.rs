use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use duckagent_llm::DynModel;
use duckagent_types::{AgentError, Result, RunContext};

use crate::capability::{CapabilityDescriptor, CostTier};
use crate::sqltext;
use crate::step::{param_bool, param_str, param_u64, Params, Step};
use crate::steps::{catalog_tables, QueryEngine, QueryOutput};

const DEFAULT_TABLE: &str = "sample_table";
const FULL_LIMIT: u64 = 1000;
const SAMPLE_LIMIT: u64 = 100;
const PREVIEW_ROWS: usize = 20;

fn row_limit(params: &Params) -> u64 {
    param_u64(params, "max_rows").unwrap_or(if param_bool(params, "sample_only") {
        SAMPLE_LIMIT
    } else {
        FULL_LIMIT
    })
}

// ---------------------------------------------------------------------------
// GenerateSql
// ---------------------------------------------------------------------------

/// Produces a read-only query for the request, through the model when one is
/// configured and from a template otherwise.
pub struct GenerateSql {
    model: Option<DynModel>,
}

impl GenerateSql {
    pub fn new(model: Option<DynModel>) -> Self {
        Self { model }
    }

    async fn resolve_table(params: &Params, context: &RunContext) -> String {
        if let Some(table) = param_str(params, "table") {
            return table.to_string();
        }
        if let Some(name) = context
            .get("full_df_table_name")
            .await
            .and_then(|v| v.as_str().map(String::from))
        {
            return name;
        }
        let snapshot = context.snapshot().await;
        catalog_tables(&snapshot)
            .and_then(|tables| tables.into_iter().next())
            .unwrap_or_else(|| DEFAULT_TABLE.to_string())
    }
}

#[async_trait]
impl Step for GenerateSql {
    fn name(&self) -> &str {
        "generate_sql"
    }

    fn describe(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(CostTier::Medium)
            .sample_capable()
            .seconds(2.0)
            .provides(&["sql"])
    }

    async fn invoke(&self, params: &Params, context: &RunContext) -> Result<Value> {
        let table = Self::resolve_table(params, context).await;
        let limit = row_limit(params);
        let template = format!("SELECT * FROM {table} LIMIT {limit}");

        let Some(model) = &self.model else {
            return Ok(json!({ "sql": template, "table": table, "llm_used": false }));
        };

        let request = context.get_string("prompt", "").await;
        let prompt = format!(
            "Write one read-only SQL query against table `{table}` that answers the \
             request below. Return only the SQL.\n\nRequest: {request}"
        );
        match model.generate(&prompt, 256).await {
            Ok(text) => {
                let sql = sqltext::ensure_limit(&sqltext::strip_code_fence(&text), limit);
                Ok(json!({ "sql": sql, "table": table, "llm_used": true }))
            }
            Err(e) => {
                tracing::warn!(error = %e, "SQL generation via model failed, using template");
                Ok(json!({ "sql": template, "table": table, "llm_used": false }))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ValidateSql
// ---------------------------------------------------------------------------

pub struct ValidateSql;

#[async_trait]
impl Step for ValidateSql {
    fn name(&self) -> &str {
        "validate_sql"
    }

    fn describe(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(CostTier::Low)
            .sample_capable()
            .seconds(0.1)
            .provides(&["sql_validation"])
            .consumes(&["sql"])
    }

    async fn invoke(&self, params: &Params, context: &RunContext) -> Result<Value> {
        let sql = match param_str(params, "sql") {
            Some(s) => s.to_string(),
            None => context.get_string("sql", "").await,
        };

        let mut issues = Vec::new();
        if sql.trim().is_empty() {
            issues.push("no SQL to validate".to_string());
        }
        if let Some(kw) = sqltext::destructive_keyword(&sql) {
            issues.push(format!("statement is not read-only ({kw})"));
        }
        if sqltext::is_multi_statement(&sql) {
            issues.push("multiple statements are not allowed".to_string());
        }
        if param_bool(params, "sample_only") && !sqltext::has_limit(&sql) {
            issues.push("sample query has no LIMIT".to_string());
        }

        let valid = issues.is_empty();
        Ok(json!({
            "valid": valid,
            "issues": issues,
            "sql_validation": { "valid": valid, "checked": sql },
        }))
    }
}

// ---------------------------------------------------------------------------
// ExecuteSql
// ---------------------------------------------------------------------------

/// Runs the context `sql` through the configured [`QueryEngine`]. Without an
/// engine it returns a fixed placeholder preview.
///
/// The sample variant is registered as `execute_sql_sample` and always caps
/// the row limit at the sample size.
pub struct ExecuteSql {
    engine: Option<Arc<dyn QueryEngine>>,
    sample: bool,
}

impl ExecuteSql {
    pub fn full(engine: Option<Arc<dyn QueryEngine>>) -> Self {
        Self {
            engine,
            sample: false,
        }
    }

    pub fn sample(engine: Option<Arc<dyn QueryEngine>>) -> Self {
        Self {
            engine,
            sample: true,
        }
    }

    fn placeholder() -> QueryOutput {
        QueryOutput {
            columns: vec!["col1".into(), "col2".into()],
            rows: vec![json!({ "col1": 1, "col2": "example" })],
            total_rows: Some(1),
        }
    }
}

#[async_trait]
impl Step for ExecuteSql {
    fn name(&self) -> &str {
        if self.sample {
            "execute_sql_sample"
        } else {
            "execute_sql"
        }
    }

    fn describe(&self) -> CapabilityDescriptor {
        let tier = if self.sample {
            CostTier::Low
        } else {
            CostTier::Medium
        };
        CapabilityDescriptor::new(tier)
            .query_engine()
            .sample_capable()
            .seconds(if self.sample { 1.0 } else { 5.0 })
            .provides(&["rows_preview"])
            .consumes(&["sql", "sql_validation"])
    }

    async fn invoke(&self, params: &Params, context: &RunContext) -> Result<Value> {
        let sql = match param_str(params, "sql") {
            Some(s) => s.to_string(),
            None => context.get_string("sql", "").await,
        };
        if sql.trim().is_empty() {
            return Err(AgentError::StepExecution {
                step: self.name().to_string(),
                message: "no SQL in context".into(),
            });
        }

        let mut max_rows = row_limit(params);
        if self.sample {
            max_rows = max_rows.min(SAMPLE_LIMIT);
        }

        let output = match &self.engine {
            Some(engine) => {
                tracing::debug!(engine = %engine.name(), max_rows, "Executing query");
                engine.query(&sql, max_rows).await?
            }
            None => Self::placeholder(),
        };

        let row_count = output.total_rows.unwrap_or(output.rows.len() as u64);
        let preview: Vec<Value> = output.rows.into_iter().take(PREVIEW_ROWS).collect();
        Ok(json!({
            "rows_preview": preview,
            "columns": output.columns,
            "row_count": row_count,
            "sample": self.sample || param_bool(params, "sample_only"),
        }))
    }
}
