//! Intent classification result.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IntentTag {
    Analyze,
    Summarize,
    Sql,
    Explore,
    /// Caller-forced mode outside the built-in set.
    Other(String),
}

impl IntentTag {
    /// Parse a tag, accepting a few synonyms. Unknown names become `Other`.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "analyze" | "analyse" | "analysis" => IntentTag::Analyze,
            "summarize" | "summarise" | "summary" => IntentTag::Summarize,
            "sql" | "query" => IntentTag::Sql,
            "explore" | "unknown" => IntentTag::Explore,
            other => IntentTag::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            IntentTag::Analyze => "analyze",
            IntentTag::Summarize => "summarize",
            IntentTag::Sql => "sql",
            IntentTag::Explore => "explore",
            IntentTag::Other(name) => name,
        }
    }
}

impl std::fmt::Display for IntentTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for IntentTag {
    fn from(s: String) -> Self {
        IntentTag::parse(&s)
    }
}

impl From<IntentTag> for String {
    fn from(tag: IntentTag) -> Self {
        tag.as_str().to_string()
    }
}

/// Advisory flags attached to an intent and carried through planning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hints {
    pub sample_only: bool,
    pub max_rows: Option<u64>,
    pub forced_mode: Option<String>,
    pub use_existing_data: bool,
    pub confirm_full_run: bool,
}

impl Hints {
    pub fn is_empty(&self) -> bool {
        *self == Hints::default()
    }

    pub fn sample(max_rows: u64) -> Self {
        Self {
            sample_only: true,
            max_rows: Some(max_rows),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentSource {
    Forced,
    Rule,
    Classifier,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub tag: IntentTag,
    pub confidence: f64,
    #[serde(default)]
    pub hints: Hints,
    pub source: IntentSource,
    /// Name of the routing rule that produced the intent, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

impl Intent {
    pub fn forced(mode: &str) -> Self {
        Self {
            tag: IntentTag::parse(mode),
            confidence: 1.0,
            hints: Hints {
                forced_mode: Some(mode.to_string()),
                ..Hints::default()
            },
            source: IntentSource::Forced,
            rule: None,
        }
    }

    /// Low-confidence default used when nothing else can classify a request.
    pub fn fallback() -> Self {
        Self {
            tag: IntentTag::Explore,
            confidence: 0.5,
            hints: Hints::default(),
            source: IntentSource::Fallback,
            rule: None,
        }
    }

    pub fn is_forced(&self) -> bool {
        self.hints.forced_mode.is_some()
    }
}
