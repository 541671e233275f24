//! Scripted attempt outcomes for dry runs.
//!
//! A script maps each model to the outcomes of its successive attempts,
//! e.g. `m1=timeout,rate_limit,ok`. Once a model's list runs out its last
//! outcome repeats. Models without a script always succeed.

use std::collections::HashMap;
use std::time::Duration;

use steadfast_core::LlmError;

/// Result of one scripted attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Timeout,
    RateLimit,
    ServerError,
    BadRequest,
    Empty,
    Invalid,
    /// Wait, then succeed
    Sleep(Duration),
}

impl Outcome {
    fn parse(raw: &str) -> anyhow::Result<Self> {
        let outcome = match raw.trim() {
            "ok" => Outcome::Ok,
            "timeout" => Outcome::Timeout,
            "rate_limit" => Outcome::RateLimit,
            "server_error" => Outcome::ServerError,
            "bad_request" => Outcome::BadRequest,
            "empty" => Outcome::Empty,
            "invalid" => Outcome::Invalid,
            other => match other.strip_prefix("sleep:") {
                Some(ms) => {
                    let ms: u64 = ms
                        .parse()
                        .map_err(|_| anyhow::anyhow!("Invalid sleep duration '{ms}'"))?;
                    Outcome::Sleep(Duration::from_millis(ms))
                }
                None => anyhow::bail!("Unknown outcome '{other}'"),
            },
        };
        Ok(outcome)
    }

    /// Play the outcome for `model`.
    pub async fn play(self, model: &str) -> Result<Option<String>, LlmError> {
        match self {
            Outcome::Ok => Ok(Some(format!("response from {model}"))),
            Outcome::Timeout => Err(LlmError::Timeout(Duration::from_secs(30))),
            Outcome::RateLimit => Err(LlmError::RateLimited { retry_after: None }),
            Outcome::ServerError => Err(LlmError::ServerError { status: 503 }),
            Outcome::BadRequest => Err(LlmError::BadRequest("rejected by script".into())),
            Outcome::Empty => Ok(None),
            Outcome::Invalid => Err(LlmError::InvalidArgument("rejected by script".into())),
            Outcome::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(Some(format!("response from {model} after {}ms", duration.as_millis())))
            }
        }
    }
}

/// Per-model outcome lists with a cursor per model.
#[derive(Debug, Default)]
pub struct Script {
    outcomes: HashMap<String, Vec<Outcome>>,
    cursors: HashMap<String, usize>,
}

impl Script {
    /// Parse `model=outcome,outcome,...` entries.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> anyhow::Result<Self> {
        let mut outcomes = HashMap::new();

        for entry in entries {
            let entry = entry.as_ref();
            let (model, list) = entry
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("Script entry '{entry}' is not model=outcomes"))?;

            let model = model.trim();
            if model.is_empty() {
                anyhow::bail!("Script entry '{entry}' has no model");
            }

            let list = list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(Outcome::parse)
                .collect::<anyhow::Result<Vec<_>>>()?;
            if list.is_empty() {
                anyhow::bail!("Script entry '{entry}' has no outcomes");
            }

            outcomes.insert(model.to_string(), list);
        }

        Ok(Self {
            outcomes,
            cursors: HashMap::new(),
        })
    }

    /// Outcome of the next attempt against `model`.
    pub fn next(&mut self, model: &str) -> Outcome {
        let Some(list) = self.outcomes.get(model) else {
            return Outcome::Ok;
        };

        let cursor = self.cursors.entry(model.to_string()).or_insert(0);
        let outcome = list[(*cursor).min(list.len() - 1)];
        *cursor += 1;
        outcome
    }
}
