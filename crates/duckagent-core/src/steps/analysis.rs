use async_trait::async_trait;
use serde_json::{json, Map, Value};

use duckagent_types::{Result, RunContext};

use crate::capability::{CapabilityDescriptor, CostTier};
use crate::step::{param_str, Params, Step};
use crate::steps::{column_names, dataset_rows, expected_row_count};

#[derive(Debug, Default)]
struct ColumnStats {
    count: u64,
    nulls: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl ColumnStats {
    fn observe(&mut self, value: Option<&Value>) {
        match value {
            None | Some(Value::Null) => self.nulls += 1,
            Some(v) => {
                if let Some(x) = v.as_f64() {
                    self.count += 1;
                    self.sum += x;
                    self.min = Some(self.min.map_or(x, |m| m.min(x)));
                    self.max = Some(self.max.map_or(x, |m| m.max(x)));
                }
            }
        }
    }

    fn to_json(&self) -> Value {
        let mean = (self.count > 0).then(|| self.sum / self.count as f64);
        json!({
            "count": self.count,
            "nulls": self.nulls,
            "mean": mean,
            "min": self.min,
            "max": self.max,
        })
    }
}

fn numeric_stats(rows: &[Value]) -> Map<String, Value> {
    let mut out = Map::new();
    for col in column_names(rows) {
        let mut stats = ColumnStats::default();
        for row in rows {
            stats.observe(row.get(&col));
        }
        if stats.count > 0 {
            out.insert(col, stats.to_json());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Analyze
// ---------------------------------------------------------------------------

/// Numeric column statistics over the dataset in context.
pub struct Analyze;

#[async_trait]
impl Step for Analyze {
    fn name(&self) -> &str {
        "analyze"
    }

    fn describe(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(CostTier::High)
            .sandboxed()
            .seconds(8.0)
            .provides(&["analysis"])
            .consumes(&["rows_preview"])
    }

    async fn invoke(&self, params: &Params, context: &RunContext) -> Result<Value> {
        let snapshot = context.snapshot().await;
        let mode = param_str(params, "analysis_mode").unwrap_or("descriptive");
        let Some(rows) = dataset_rows(&snapshot) else {
            return Ok(json!({
                "analysis": { "mode": mode, "n_rows": 0, "note": "no dataset provided" },
            }));
        };

        let n_rows = expected_row_count(&snapshot).unwrap_or(rows.len() as u64);
        tracing::debug!(rows = rows.len(), mode, "Computing column statistics");
        Ok(json!({
            "analysis": {
                "mode": mode,
                "n_rows": n_rows,
                "sampled_rows": rows.len(),
                "columns": numeric_stats(rows),
            },
            "metrics": { "n_rows": n_rows },
        }))
    }
}

// ---------------------------------------------------------------------------
// DescribeStats
// ---------------------------------------------------------------------------

/// Cheap stand-in for [`Analyze`]: row count and column names only.
pub struct DescribeStats;

#[async_trait]
impl Step for DescribeStats {
    fn name(&self) -> &str {
        "describe_stats"
    }

    fn describe(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(CostTier::Low)
            .sandboxed()
            .sample_capable()
            .seconds(0.5)
            .provides(&["analysis"])
            .consumes(&["rows_preview"])
    }

    async fn invoke(&self, _params: &Params, context: &RunContext) -> Result<Value> {
        let snapshot = context.snapshot().await;
        let rows = dataset_rows(&snapshot).cloned().unwrap_or_default();
        let n_rows = expected_row_count(&snapshot).unwrap_or(0);
        Ok(json!({
            "analysis": {
                "mode": "describe",
                "n_rows": n_rows,
                "columns": column_names(&rows),
            },
        }))
    }
}
