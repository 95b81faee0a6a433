use async_trait::async_trait;
use serde_json::{json, Value};

use duckagent_llm::DynModel;
use duckagent_types::{Result, RunContext};

use crate::capability::{CapabilityDescriptor, CostTier};
use crate::step::{Params, Step};
use crate::steps::{column_names, dataset_rows, expected_row_count};

const NO_DATA: &str = "No data available to summarize. Provide a dataset or run a query first.";
const PROMPT_ROWS: usize = 5;

/// Narrative summary of whatever dataset and analysis the context holds.
pub struct Summarize {
    model: Option<DynModel>,
}

impl Summarize {
    pub fn new(model: Option<DynModel>) -> Self {
        Self { model }
    }

    fn template(n_rows: u64, columns: &[String], analysis: Option<&Value>) -> String {
        let mut text = format!(
            "Dataset with {n_rows} rows and {} columns ({}).",
            columns.len(),
            columns.join(", ")
        );
        let stats = analysis
            .and_then(|a| a.get("columns"))
            .and_then(Value::as_object);
        if let Some(stats) = stats {
            for (col, s) in stats.iter().take(3) {
                if let Some(mean) = s.get("mean").and_then(Value::as_f64) {
                    text.push_str(&format!(" Average {col}: {mean:.2}."));
                }
            }
        }
        text
    }
}

#[async_trait]
impl Step for Summarize {
    fn name(&self) -> &str {
        "summarize"
    }

    fn describe(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(CostTier::Low)
            .sample_capable()
            .seconds(1.5)
            .provides(&["summary"])
            .consumes(&["rows_preview", "analysis"])
    }

    async fn invoke(&self, _params: &Params, context: &RunContext) -> Result<Value> {
        let snapshot = context.snapshot().await;

        let Some(rows) = dataset_rows(&snapshot) else {
            let reference = snapshot
                .get("full_df_table_name")
                .or_else(|| snapshot.get("full_df"))
                .and_then(Value::as_str);
            let summary = match reference {
                Some(name) => format!(
                    "Dataset '{name}' is available but no rows were materialized for summarization."
                ),
                None => NO_DATA.to_string(),
            };
            return Ok(json!({ "summary": summary, "llm_used": false }));
        };

        let n_rows = expected_row_count(&snapshot).unwrap_or(rows.len() as u64);
        let columns = column_names(rows);
        let analysis = snapshot.get("analysis");
        let template = Self::template(n_rows, &columns, analysis);

        let Some(model) = &self.model else {
            return Ok(json!({ "summary": template, "llm_used": false }));
        };

        let head: Vec<&Value> = rows.iter().take(PROMPT_ROWS).collect();
        let prompt = format!(
            "Summarize this dataset for a business reader in a few sentences.\n\
             Request: {}\nRows: {n_rows}\nColumns: {}\nSample: {}\nStatistics: {}",
            snapshot.get("prompt").and_then(Value::as_str).unwrap_or(""),
            columns.join(", "),
            json!(head),
            analysis.cloned().unwrap_or(Value::Null),
        );
        match model.generate(&prompt, 400).await {
            Ok(text) => Ok(json!({ "summary": text.trim(), "llm_used": true })),
            Err(e) => {
                tracing::warn!(error = %e, "Summary via model failed, using template");
                Ok(json!({ "summary": template, "llm_used": false }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duckagent_llm::MockModel;

    #[tokio::test]
    async fn no_data_message() {
        let out = Summarize::new(None)
            .invoke(&Params::new(), &RunContext::new())
            .await
            .unwrap();
        assert_eq!(out["summary"], NO_DATA);
    }

    #[tokio::test]
    async fn dataset_reference_without_rows() {
        let ctx = RunContext::new();
        ctx.set("full_df", json!("warehouse.orders")).await;
        let out = Summarize::new(None).invoke(&Params::new(), &ctx).await.unwrap();
        assert!(out["summary"].as_str().unwrap().contains("warehouse.orders"));
    }

    #[tokio::test]
    async fn template_mentions_row_count_and_means() {
        let ctx = RunContext::new();
        ctx.set("rows_preview", json!([{"x": 1}, {"x": 3}])).await;
        ctx.set("row_count", json!(2)).await;
        ctx.set("analysis", json!({"columns": {"x": {"mean": 2.0}}}))
            .await;
        let out = Summarize::new(None).invoke(&Params::new(), &ctx).await.unwrap();
        let text = out["summary"].as_str().unwrap();
        assert!(text.starts_with("Dataset with 2 rows and 1 columns (x)."));
        assert!(text.contains("Average x: 2.00."));
    }

    #[tokio::test]
    async fn model_summary_is_used() {
        let ctx = RunContext::new();
        ctx.set("full_df", json!([{"x": 1}])).await;
        let model = DynModel::new(MockModel::scripted(vec!["  One row of x.  ".into()]));
        let out = Summarize::new(Some(model))
            .invoke(&Params::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(out["summary"], "One row of x.");
        assert_eq!(out["llm_used"], true);
    }
}
