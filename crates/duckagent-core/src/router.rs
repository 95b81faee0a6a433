//! Intent routing: ordered deterministic rules, then an optional classifier.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use duckagent_llm::DynModel;
use duckagent_types::{AgentError, Result, RunContext};

use crate::intent::{Hints, Intent, IntentSource, IntentTag};
use crate::steps::catalog_tables;

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub tag: IntentTag,
    pub confidence: f64,
    pub hints: Hints,
}

pub trait RoutingRule: Send + Sync {
    fn name(&self) -> &str;

    /// Inspect the prompt and a read-only view of the context.
    fn evaluate(&self, prompt: &str, context: &HashMap<String, Value>) -> Option<RuleMatch>;
}

/// Fires when the prompt matches a case-insensitive regex.
pub struct KeywordRule {
    name: String,
    pattern: Regex,
    tag: IntentTag,
    confidence: f64,
}

impl KeywordRule {
    pub fn new(name: &str, pattern: &str, tag: IntentTag, confidence: f64) -> Result<Self> {
        let pattern = Regex::new(&format!("(?i){pattern}"))
            .map_err(|e| AgentError::Config(format!("routing rule '{name}': {e}")))?;
        Ok(Self {
            name: name.to_string(),
            pattern,
            tag,
            confidence,
        })
    }
}

impl RoutingRule for KeywordRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, prompt: &str, _context: &HashMap<String, Value>) -> Option<RuleMatch> {
        self.pattern.is_match(prompt).then(|| RuleMatch {
            tag: self.tag.clone(),
            confidence: self.confidence,
            hints: Hints::default(),
        })
    }
}

/// "revenue by country", "churn per region": a measure grouped by a dimension.
pub struct BreakdownRule {
    pattern: Regex,
}

const NOT_A_MEASURE: &[&str] = &["order", "group", "sort", "sorted", "ordered", "partition"];

impl BreakdownRule {
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(r"(?i)\b([a-z_]+)\s+(?:by|per|across)\s+[a-z_]+")
            .map_err(|e| AgentError::Config(format!("routing rule 'breakdown': {e}")))?;
        Ok(Self { pattern })
    }
}

impl RoutingRule for BreakdownRule {
    fn name(&self) -> &str {
        "breakdown"
    }

    fn evaluate(&self, prompt: &str, _context: &HashMap<String, Value>) -> Option<RuleMatch> {
        let grouped = self.pattern.captures_iter(prompt).any(|caps| {
            caps.get(1).is_some_and(|m| {
                !NOT_A_MEASURE.contains(&m.as_str().to_lowercase().as_str())
            })
        });
        grouped.then(|| RuleMatch {
            tag: IntentTag::Analyze,
            confidence: 0.92,
            hints: Hints::default(),
        })
    }
}

/// The prompt names a dataset or table the context already knows about.
pub struct DatasetMentionRule;

fn mentions(haystack: &str, needle: &str) -> bool {
    if needle.len() < 2 {
        return false;
    }
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}

impl RoutingRule for DatasetMentionRule {
    fn name(&self) -> &str {
        "dataset_mention"
    }

    fn evaluate(&self, prompt: &str, context: &HashMap<String, Value>) -> Option<RuleMatch> {
        let mut names = catalog_tables(context).unwrap_or_default();
        if let Some(name) = context.get("full_df_table_name").and_then(Value::as_str) {
            names.push(name.to_lowercase());
        }
        let lowered = prompt.to_lowercase();
        names.iter().any(|n| mentions(&lowered, n)).then(|| RuleMatch {
            tag: IntentTag::Summarize,
            confidence: 0.85,
            hints: Hints {
                use_existing_data: true,
                ..Hints::default()
            },
        })
    }
}

/// Prompts under `min_words` words are too thin to classify.
pub struct ShortPromptRule {
    pub min_words: usize,
}

impl RoutingRule for ShortPromptRule {
    fn name(&self) -> &str {
        "short_prompt"
    }

    fn evaluate(&self, prompt: &str, _context: &HashMap<String, Value>) -> Option<RuleMatch> {
        (prompt.split_whitespace().count() < self.min_words).then(|| RuleMatch {
            tag: IntentTag::Explore,
            confidence: 0.40,
            hints: Hints::default(),
        })
    }
}

/// Built-in rules in evaluation order.
pub fn default_rules() -> Result<Vec<Box<dyn RoutingRule>>> {
    Ok(vec![
        Box::new(KeywordRule::new(
            "analysis_keywords",
            r"\b(analy[sz]e|analysis|analytics|regress\w*|correlat\w*|drivers?|model|predict\w*|trends?)\b",
            IntentTag::Analyze,
            0.92,
        )?),
        Box::new(BreakdownRule::new()?),
        // before SQL, so "summary" is never read as "sum"
        Box::new(KeywordRule::new(
            "summary_keywords",
            r"\b(summary|summari[sz]e|describe|overview|insights?)\b",
            IntentTag::Summarize,
            0.93,
        )?),
        Box::new(KeywordRule::new(
            "sql_keywords",
            r"\b(count|how many|top|sum|avg|average|group by|order by|select|min|max)\b",
            IntentTag::Sql,
            0.90,
        )?),
        Box::new(DatasetMentionRule),
        Box::new(ShortPromptRule { min_words: 3 }),
    ])
}

// ---------------------------------------------------------------------------
// Fallback classifier
// ---------------------------------------------------------------------------

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, prompt: &str, context_keys: &[String]) -> Result<Intent>;
}

/// Asks a language model for a JSON verdict `{"intent": .., "confidence": ..}`.
pub struct LlmClassifier {
    model: DynModel,
}

#[derive(Deserialize)]
struct Verdict {
    intent: String,
    confidence: f64,
    #[serde(default)]
    hints: Hints,
}

impl LlmClassifier {
    pub fn new(model: DynModel) -> Self {
        Self { model }
    }

    fn parse(text: &str) -> Result<Intent> {
        let start = text.find('{');
        let end = text.rfind('}');
        let (Some(start), Some(end)) = (start, end) else {
            return Err(AgentError::Other(format!(
                "classifier answer is not JSON: {text}"
            )));
        };
        let verdict: Verdict = serde_json::from_str(&text[start..=end])?;
        Ok(Intent {
            tag: IntentTag::parse(&verdict.intent),
            confidence: verdict.confidence.clamp(0.0, 1.0),
            hints: verdict.hints,
            source: IntentSource::Classifier,
            rule: None,
        })
    }
}

#[async_trait]
impl IntentClassifier for LlmClassifier {
    async fn classify(&self, prompt: &str, context_keys: &[String]) -> Result<Intent> {
        let request = format!(
            "Classify the analytics request into one of: analyze, summarize, sql, explore.\n\
             Available context keys: {}\n\
             Answer with JSON only, e.g. {{\"intent\": \"sql\", \"confidence\": 0.8}}.\n\n\
             Request: {prompt}",
            context_keys.join(", ")
        );
        let text = self.model.generate(&request, 64).await?;
        Self::parse(&text)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct Router {
    rules: Vec<Box<dyn RoutingRule>>,
    threshold: f64,
    classifier: Option<Arc<dyn IntentClassifier>>,
}

impl Router {
    pub fn new(threshold: f64) -> Result<Self> {
        Ok(Self {
            rules: default_rules()?,
            threshold,
            classifier: None,
        })
    }

    /// Router with no rules at all; every prompt goes to the classifier.
    pub fn empty(threshold: f64) -> Self {
        Self {
            rules: Vec::new(),
            threshold,
            classifier: None,
        }
    }

    pub fn with_rule(mut self, rule: impl RoutingRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Classify `prompt`. Never fails: the worst case is a low-confidence
    /// `explore` intent.
    pub async fn detect_intent(
        &self,
        prompt: &str,
        user_mode: Option<&str>,
        context: &RunContext,
    ) -> Intent {
        if let Some(mode) = user_mode.filter(|m| !m.trim().is_empty()) {
            let intent = Intent::forced(mode);
            tracing::info!(intent = %intent.tag, "Intent forced by caller");
            return intent;
        }

        let snapshot = context.snapshot().await;
        let matched = self
            .rules
            .iter()
            .find_map(|rule| rule.evaluate(prompt, &snapshot).map(|m| (rule.name(), m)));

        let best = match matched {
            Some((rule, m)) if m.confidence >= self.threshold => {
                tracing::info!(intent = %m.tag, confidence = m.confidence, rule, "Intent detected");
                return Intent {
                    tag: m.tag,
                    confidence: m.confidence,
                    hints: m.hints,
                    source: IntentSource::Rule,
                    rule: Some(rule.to_string()),
                };
            }
            Some((_, m)) => m.confidence,
            None => 0.0,
        };

        let ambiguous = AgentError::RoutingAmbiguous {
            confidence: best,
            threshold: self.threshold,
        };
        tracing::debug!(reason = %ambiguous, "Consulting fallback classifier");

        if let Some(classifier) = &self.classifier {
            let mut keys: Vec<String> = snapshot.keys().cloned().collect();
            keys.sort();
            match classifier.classify(prompt, &keys).await {
                Ok(intent) => {
                    tracing::info!(intent = %intent.tag, confidence = intent.confidence, "Intent classified");
                    return intent;
                }
                Err(e) => tracing::warn!(error = %e, "Fallback classifier failed"),
            }
        }
        Intent::fallback()
    }
}
