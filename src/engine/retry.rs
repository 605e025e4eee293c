//! Retry policy for leaf steps.
//!
//! Attempts are 1-based. The policy decides whether a failed attempt is
//! retried and how long to wait before the next one; the leaf executor owns
//! the actual sleep so cancellation can be observed between attempts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub backoff: BackoffStrategy,

    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Substring patterns an error must match to be retried. Empty means
    /// every error is retryable.
    #[serde(default)]
    pub retry_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// The initial delay before every retry.
    Fixed,
    /// `initial_delay * base^(attempt - 1)`, capped at `max_delay`.
    Exponential {
        #[serde(default = "default_exponential_base")]
        base: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: default_exponential_base(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::default(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            retry_on: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Whether a failed `attempt` should be tried again for `error`.
    pub fn should_retry(&self, attempt: u32, error: &str) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        if self.retry_on.is_empty() {
            return true;
        }
        let error_lower = error.to_lowercase();
        self.retry_on
            .iter()
            .any(|pattern| error_lower.contains(&pattern.to_lowercase()))
    }

    /// Delay before the retry that follows failed attempt `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = match &self.backoff {
            BackoffStrategy::Fixed => self.initial_delay,
            BackoffStrategy::Exponential { base } => {
                let multiplier = base.powi(attempt.saturating_sub(1) as i32);
                Duration::from_secs_f64(self.initial_delay.as_secs_f64() * multiplier)
            }
        };
        delay.min(self.max_delay)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_exponential_base() -> f64 {
    2.0
}
