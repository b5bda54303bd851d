//! Application configuration shared by dispatchers and workers

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{TaskError, TaskResult};

/// What a chord does with its body when a header member fails
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChordFailurePolicy {
    /// Never run the body; the chord result resolves to FAILURE
    #[default]
    Abort,
    /// Run the body over the successful header results, in header order
    FireWithSuccessful,
}

impl FromStr for ChordFailurePolicy {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "fire_with_successful" | "partial" => Ok(Self::FireWithSuccessful),
            other => Err(TaskError::config(format!("unknown chord policy: {other}"))),
        }
    }
}

/// Configuration passed explicitly to [`crate::Dispatcher`] and [`crate::Worker`]
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Redis connection URL
    pub redis_url: String,
    /// Queue used when a signature does not name one
    pub default_queue: String,
    /// Task result TTL in seconds
    pub result_ttl: u64,
    /// How often result handles poll the backend, in milliseconds
    pub result_poll_interval_ms: u64,
    /// Default policy for chords that do not set their own
    pub chord_failure_policy: ChordFailurePolicy,
    /// Whether malformed messages are kept in a dead-letter list
    pub dead_letter: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            default_queue: "default".to_string(),
            result_ttl: 86400, // 24 hours
            result_poll_interval_ms: 100,
            chord_failure_policy: ChordFailurePolicy::Abort,
            dead_letter: true,
        }
    }
}

impl AppConfig {
    /// Build a configuration from `TC_*` environment variables, falling back to defaults
    pub fn from_env() -> TaskResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> TaskResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("TC_REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(queue) = lookup("TC_DEFAULT_QUEUE") {
            if queue.is_empty() {
                return Err(TaskError::config("TC_DEFAULT_QUEUE must not be empty"));
            }
            config.default_queue = queue;
        }
        if let Some(ttl) = lookup("TC_RESULT_TTL") {
            config.result_ttl = parse_number("TC_RESULT_TTL", &ttl)?;
        }
        if let Some(interval) = lookup("TC_POLL_INTERVAL_MS") {
            config.result_poll_interval_ms = parse_number("TC_POLL_INTERVAL_MS", &interval)?;
        }
        if let Some(policy) = lookup("TC_CHORD_POLICY") {
            config.chord_failure_policy = policy.parse()?;
        }

        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.result_poll_interval_ms.max(1))
    }
}

fn parse_number(key: &str, value: &str) -> TaskResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|e| TaskError::config(format!("{key}={value}: {e}")))
}
