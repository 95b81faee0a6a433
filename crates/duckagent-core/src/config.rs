//! Run-time configuration, loaded from JSON with every field defaulted.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use duckagent_types::{AgentError, Result};

use crate::capability::{CostTier, SubstitutePolicy};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Router confidence below which the fallback classifier is consulted.
    pub confidence_threshold: f64,
    pub retry: RetryPolicy,
    pub step_timeout_ms: u64,
    /// Per-step overrides of `step_timeout_ms`, keyed by step name.
    pub step_timeouts_ms: HashMap<String, u64>,
    /// Row cap applied when a node is narrowed to sample scope.
    pub sample_rows: u64,
    /// Row limit assumed for query steps that do not set `max_rows`.
    pub default_max_rows: u64,
    pub row_bytes_estimate: u64,
    pub max_scan_bytes: u64,
    pub max_cost_tier: CostTier,
    pub min_non_null_rate: f64,
    pub substitute_policy: SubstitutePolicy,
    pub redaction: RedactionConfig,
    pub backends: BackendConfig,
    pub llm: LlmConfig,
    /// Step sequences for intents outside the built-in set.
    pub sequences: HashMap<String, Vec<String>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            retry: RetryPolicy::default(),
            step_timeout_ms: 30_000,
            step_timeouts_ms: HashMap::new(),
            sample_rows: 100,
            default_max_rows: 1000,
            row_bytes_estimate: 256,
            max_scan_bytes: 256 * 1024 * 1024,
            max_cost_tier: CostTier::High,
            min_non_null_rate: 0.5,
            substitute_policy: SubstitutePolicy::default(),
            redaction: RedactionConfig::default(),
            backends: BackendConfig::default(),
            llm: LlmConfig::default(),
            sequences: HashMap::new(),
        }
    }
}

impl AgentConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: AgentConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(AgentError::Config(format!(
                "confidence_threshold must be within 0.0..=1.0, got {}",
                self.confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.min_non_null_rate) {
            return Err(AgentError::Config(format!(
                "min_non_null_rate must be within 0.0..=1.0, got {}",
                self.min_non_null_rate
            )));
        }
        if self.step_timeout_ms == 0 {
            return Err(AgentError::Config("step_timeout_ms must be positive".into()));
        }
        if self.sample_rows == 0 {
            return Err(AgentError::Config("sample_rows must be positive".into()));
        }
        Ok(())
    }

    pub fn step_timeout(&self, step: &str) -> Duration {
        let ms = self
            .step_timeouts_ms
            .get(step)
            .copied()
            .unwrap_or(self.step_timeout_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    /// Case-insensitive substrings that mark a key as sensitive.
    pub keys: Vec<String>,
    /// Regexes whose matches inside string values are replaced.
    pub patterns: Vec<String>,
    pub placeholder: String,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            keys: ["key", "secret", "token", "password", "api"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            patterns: vec![
                r"sk-[A-Za-z0-9_\-]{8,}".to_string(),
                r"(?i)bearer\s+[A-Za-z0-9._\-]+".to_string(),
            ],
            placeholder: "<REDACTED>".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the hosted run service. Unset disables the hosted backend.
    pub hosted_endpoint: Option<String>,
    /// Environment variable holding the hosted service API key.
    pub hosted_api_key_env: String,
    pub probe_timeout_ms: u64,
    pub local_runtime: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            hosted_endpoint: None,
            hosted_api_key_env: "DUCKAGENT_HOSTED_API_KEY".to_string(),
            probe_timeout_ms: 2_000,
            local_runtime: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[default]
    None,
    Mock,
    Openai,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub token_budget: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = AgentConfig::default();
        assert_eq!(config.confidence_threshold, 0.6);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.step_timeout("anything"), Duration::from_secs(30));
        assert_eq!(config.substitute_policy, SubstitutePolicy::AllowCheaper);
        assert!(config.backends.local_runtime);
        assert_eq!(config.redaction.placeholder, "<REDACTED>");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = AgentConfig::from_json_str(
            r#"{"confidence_threshold": 0.75, "step_timeouts_ms": {"execute_sql": 500}}"#,
        )
        .unwrap();
        assert_eq!(config.confidence_threshold, 0.75);
        assert_eq!(config.step_timeout("execute_sql"), Duration::from_millis(500));
        assert_eq!(config.step_timeout("summarize"), Duration::from_secs(30));
        assert_eq!(config.sample_rows, 100);
    }

    #[test]
    fn invalid_threshold_is_rejected() {
        let err = AgentConfig::from_json_str(r#"{"confidence_threshold": 1.5}"#).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn enums_parse_from_snake_case() {
        let config = AgentConfig::from_json_str(
            r#"{"substitute_policy": "same_tier", "max_cost_tier": "medium", "llm": {"provider": "mock"}}"#,
        )
        .unwrap();
        assert_eq!(config.substitute_policy, SubstitutePolicy::SameTier);
        assert_eq!(config.max_cost_tier, CostTier::Medium);
        assert_eq!(config.llm.provider, LlmProvider::Mock);
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"sample_rows": 25}}"#).unwrap();
        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.sample_rows, 25);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = AgentConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, AgentError::Io(_)));
    }
}
