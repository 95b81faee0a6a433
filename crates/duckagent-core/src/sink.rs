//! Destinations for finalized run results.
//!
//! The orchestrator never persists anything itself; callers hand the
//! finished [`RunResult`] to a [`ResultSink`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use duckagent_types::Result;

use crate::result::RunResult;

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Store `run` and return where it went.
    async fn store(&self, run: &RunResult) -> Result<String>;
}

/// Writes each run to `<dir>/<run_id>.json`, creating `dir` when missing.
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, run: &RunResult) -> PathBuf {
        self.dir.join(format!("{}.json", run.run_id))
    }

    pub async fn load(path: &Path) -> Result<RunResult> {
        let json = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[async_trait]
impl ResultSink for JsonFileSink {
    async fn store(&self, run: &RunResult) -> Result<String> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(run);
        tokio::fs::write(&path, run.to_json_pretty()?).await?;
        tracing::debug!(path = %path.display(), run_id = %run.run_id, "Run result saved");
        Ok(path.display().to_string())
    }
}
