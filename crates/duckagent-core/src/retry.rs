//! Retry limits and backoff between attempts of a single node.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed { delay_ms: u64 },
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base_ms: u64, max_ms: u64 },
    /// No delay between retries.
    #[default]
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given retry number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffPolicy::Exponential { base_ms, max_ms } => {
                let millis = base_ms.saturating_mul(2u64.saturating_pow(attempt as u32));
                Duration::from_millis(millis.min(*max_ms))
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

/// How many times a node may be re-invoked. Step failures (timeouts
/// included) and `retry_sample` validation results each get `max_retries`
/// re-invocations of their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: BackoffPolicy::None,
        }
    }
}

impl RetryPolicy {
    /// A fresh allowance for one kind of failure on one node.
    pub fn budget(&self) -> RetryBudget {
        RetryBudget {
            used: 0,
            max_retries: self.max_retries,
        }
    }
}

/// Retries left for one kind of failure on one node.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    used: usize,
    max_retries: usize,
}

impl RetryBudget {
    /// Take one retry if any is left.
    pub fn take(&mut self) -> bool {
        if self.used < self.max_retries {
            self.used += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_constant_delay() {
        let policy = BackoffPolicy::Fixed { delay_ms: 200 };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(200));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::Exponential {
            base_ms: 100,
            max_ms: 1000,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(1000));
    }

    #[test]
    fn none_backoff_zero_delay() {
        assert_eq!(BackoffPolicy::None.delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn default_policy_allows_one_retry() {
        let mut budget = RetryPolicy::default().budget();
        assert!(budget.take());
        assert!(!budget.take());
    }

    #[test]
    fn zero_retries_allows_none() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        assert!(!policy.budget().take());
    }

    #[test]
    fn backoff_deserializes_from_tagged_json() {
        let policy: BackoffPolicy =
            serde_json::from_str(r#"{"kind":"exponential","base_ms":50,"max_ms":400}"#).unwrap();
        assert_eq!(
            policy,
            BackoffPolicy::Exponential {
                base_ms: 50,
                max_ms: 400
            }
        );
        let none: BackoffPolicy = serde_json::from_str(r#"{"kind":"none"}"#).unwrap();
        assert_eq!(none, BackoffPolicy::None);
    }
}
