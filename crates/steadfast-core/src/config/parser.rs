//! Reliability configuration parsing from YAML/JSON.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::schema::validate_config_schema;
use crate::routing::FallbackRouting;

/// Errors that can occur when loading a reliability config.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config does not match schema: {}", .0.join("; "))]
    SchemaError(Vec<String>),

    #[error("Config validation failed: {0}")]
    ValidationError(String),

    #[error("Invalid retry pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Delay growth between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// `base * 2^attempt`, capped at `max_delay`
    #[default]
    Exponential,

    /// Always `base`
    Constant,

    /// Unrecognised strategy name; behaves as a flat `base` delay
    #[serde(other)]
    Unknown,
}

/// How retries interact with the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// Spend the retry budget on each model before advancing the chain.
    #[default]
    PerModel,

    /// Retry only when the chain holds a single model; otherwise a
    /// retryable failure advances to the next model immediately.
    FallbackFirst,
}

/// Retry section of a reliability config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum retries per model (0 disables retrying)
    pub max: u32,

    /// Backoff strategy
    pub backoff: Backoff,

    /// Base delay (in seconds)
    #[serde(with = "duration_secs")]
    pub base: Duration,

    /// Cap for the deterministic part of the delay (in seconds)
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,

    /// Extra error kinds to treat as retryable
    pub on: Vec<String>,

    /// Regexes matched against error messages to treat as retryable
    pub patterns: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max: 0,
            backoff: Backoff::Exponential,
            base: Duration::from_millis(400),
            max_delay: Duration::from_secs(3),
            on: Vec::new(),
            patterns: Vec::new(),
        }
    }
}

/// Circuit breaker section of a reliability config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within the window before the circuit opens
    pub errors: u32,

    /// Length of the failure window (in seconds)
    #[serde(with = "duration_secs")]
    pub within: Duration,

    /// How long the circuit stays open (in seconds)
    #[serde(with = "duration_secs")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            errors: 10,
            within: Duration::from_secs(60),
            cooldown: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a breaker config.
    pub fn new(errors: u32, within: Duration, cooldown: Duration) -> Self {
        Self {
            errors,
            within,
            cooldown,
        }
    }
}

/// Reliability policy for one logical LLM call.
///
/// Built once, then handed to the executor. Never mutated after that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// Retry policy
    pub retries: RetryConfig,

    /// Retry/fallback precedence
    pub retry_mode: RetryMode,

    /// Models tried after the primary, in order
    pub fallback_models: Vec<String>,

    /// Circuit breaker policy; `None` disables breakers entirely
    #[serde(deserialize_with = "non_empty_breaker")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Wall-clock budget across all models and retries (in seconds)
    #[serde(with = "duration_secs_opt")]
    pub total_timeout: Option<Duration>,
}

impl ReliabilityConfig {
    /// Parse a config from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let raw: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(serde_json::to_value(raw)?)
    }

    /// Parse a config from JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Self::from_value(serde_json::from_str(json)?)
    }

    /// Parse a config from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Build a config from an already-parsed JSON document.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        // An empty document is the all-defaults policy
        let value = if value.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            value
        };

        validate_config_schema(&value).map_err(ConfigError::SchemaError)?;

        let config: ReliabilityConfig = serde_json::from_value(value)?;
        config.validate()?;

        tracing::debug!(
            max_retries = config.retries.max,
            fallbacks = config.fallback_models.len(),
            circuit_breaker = config.circuit_breaker.is_some(),
            total_timeout = ?config.total_timeout,
            "Loaded reliability config"
        );
        Ok(config)
    }

    /// Validate semantic constraints the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(breaker) = &self.circuit_breaker {
            if breaker.errors == 0 {
                return Err(ConfigError::ValidationError(
                    "circuit_breaker.errors must be at least 1".to_string(),
                ));
            }
        }

        if let Some(model) = self.fallback_models.iter().find(|m| m.trim().is_empty()) {
            return Err(ConfigError::ValidationError(format!(
                "fallback model identifiers must not be blank (got {model:?})"
            )));
        }

        for pattern in &self.retries.patterns {
            regex::Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
        }

        Ok(())
    }

    /// The deduplicated chain of models for the given primary.
    pub fn models_to_try(&self, primary: &str) -> Vec<String> {
        FallbackRouting::new(primary, &self.fallback_models)
            .models()
            .to_vec()
    }

    /// Set the maximum retries per model.
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.retries.max = max;
        self
    }

    /// Set the backoff strategy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.retries.backoff = backoff;
        self
    }

    /// Set the base retry delay.
    pub fn with_base_delay(mut self, base: Duration) -> Self {
        self.retries.base = base;
        self
    }

    /// Set the retry delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.retries.max_delay = max_delay;
        self
    }

    /// Treat another error kind as retryable.
    pub fn with_retry_on(mut self, kind: impl Into<String>) -> Self {
        self.retries.on.push(kind.into());
        self
    }

    /// Treat errors whose message matches `pattern` as retryable.
    pub fn with_retry_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.retries.patterns.push(pattern.into());
        self
    }

    /// Set the retry/fallback precedence.
    pub fn with_retry_mode(mut self, mode: RetryMode) -> Self {
        self.retry_mode = mode;
        self
    }

    /// Append a fallback model.
    pub fn with_fallback(mut self, model: impl Into<String>) -> Self {
        self.fallback_models.push(model.into());
        self
    }

    /// Append several fallback models.
    pub fn with_fallbacks<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_models
            .extend(models.into_iter().map(Into::into));
        self
    }

    /// Enable circuit breakers.
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    /// Set the total wall-clock budget.
    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }
}

/// Durations given as seconds (`2.5`) or human-readable text (`"500ms"`).
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(f64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> Result<Duration, String> {
        match self {
            RawDuration::Seconds(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|e| format!("invalid duration {secs}: {e}")),
            RawDuration::Text(text) => humantime::parse_duration(text.trim())
                .map_err(|e| format!("invalid duration {text:?}: {e}")),
        }
    }
}

mod duration_secs {
    use super::RawDuration;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        RawDuration::deserialize(deserializer)?
            .into_duration()
            .map_err(D::Error::custom)
    }
}

mod duration_secs_opt {
    use super::RawDuration;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<RawDuration>::deserialize(deserializer)?
            .map(RawDuration::into_duration)
            .transpose()
            .map_err(D::Error::custom)
    }
}

/// An empty `circuit_breaker` mapping means "not configured", same as absent.
fn non_empty_breaker<'de, D>(deserializer: D) -> Result<Option<CircuitBreakerConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let raw = Option::<BTreeMap<String, serde_json::Value>>::deserialize(deserializer)?;
    match raw {
        Some(fields) if !fields.is_empty() => {
            let object = serde_json::Value::Object(fields.into_iter().collect());
            serde_json::from_value(object)
                .map(Some)
                .map_err(D::Error::custom)
        }
        _ => Ok(None),
    }
}
