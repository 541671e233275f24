//! Error classification for attempt failures.
//!
//! Every error raised by an attempt callback is sorted into one of three
//! classes. The class decides whether the executor retries the same model,
//! moves on to the next model, or stops immediately.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

lazy_static! {
    /// HTTP status codes that signal overload or a transient server fault.
    static ref TRANSIENT_STATUS: Regex = Regex::new(r"\b(408|409|425|429|5\d\d)\b").unwrap();

    /// Provider phrases for timeouts, dropped connections and throttling.
    static ref TRANSIENT_PHRASE: Regex = Regex::new(
        r"(?i)(timed? ?out|timeout|connection (reset|refused|closed)|broken pipe|rate.?limit|too many requests|overloaded|temporarily unavailable|service unavailable|bad gateway)"
    ).unwrap();
}

/// How an attempt failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeouts, connection resets, rate limits, 5xx. Worth retrying.
    Transient,

    /// The request failed for this model and retrying it will not help.
    /// The next model in the chain may still succeed.
    Permanent,

    /// A bug in the caller (bad argument, type mismatch). Never retried,
    /// never masked by falling back to another model.
    Fatal,
}

impl ErrorClass {
    /// Classify free-form provider error text.
    ///
    /// Anything that does not look transient is treated as permanent;
    /// nothing is ever classified fatal from a message alone.
    pub fn from_message(message: &str) -> Self {
        if TRANSIENT_STATUS.is_match(message) || TRANSIENT_PHRASE.is_match(message) {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Errors that can be sorted into an [`ErrorClass`].
///
/// Implement this for the error type returned by your attempt callback.
pub trait Classify: fmt::Display {
    /// The handling class of this error.
    fn class(&self) -> ErrorClass;

    /// Stable identifier for this kind of error.
    ///
    /// Matched against `retries.on` to make additional kinds retryable.
    fn kind(&self) -> &str {
        "error"
    }
}

impl<T: Classify + ?Sized> Classify for &T {
    fn class(&self) -> ErrorClass {
        (**self).class()
    }

    fn kind(&self) -> &str {
        (**self).kind()
    }
}

impl<T: Classify + ?Sized> Classify for Box<T> {
    fn class(&self) -> ErrorClass {
        (**self).class()
    }

    fn kind(&self) -> &str {
        (**self).kind()
    }
}

/// An attempt reported success but produced no value.
///
/// Callers using optional results convert this into their own error type;
/// it is handled as a permanent failure of that model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("model {model} returned an empty response")]
pub struct EmptyResponse {
    pub model: String,
}

impl Classify for EmptyResponse {
    fn class(&self) -> ErrorClass {
        ErrorClass::Permanent
    }

    fn kind(&self) -> &str {
        "empty_response"
    }
}

/// Errors from LLM provider calls.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection reset by provider")]
    ConnectionReset,

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Server error: {status}")]
    ServerError { status: u16 },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Authentication failed")]
    Authentication,

    #[error("Model {model} returned an empty response")]
    EmptyResponse { model: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Other(String),
}

impl Classify for LlmError {
    fn class(&self) -> ErrorClass {
        match self {
            LlmError::Timeout(_) | LlmError::ConnectionReset | LlmError::RateLimited { .. } => {
                ErrorClass::Transient
            }
            LlmError::ServerError { status } if *status >= 500 => ErrorClass::Transient,
            LlmError::ServerError { .. }
            | LlmError::BadRequest(_)
            | LlmError::Authentication
            | LlmError::EmptyResponse { .. } => ErrorClass::Permanent,
            LlmError::InvalidArgument(_) => ErrorClass::Fatal,
            LlmError::Other(message) => ErrorClass::from_message(message),
        }
    }

    fn kind(&self) -> &str {
        match self {
            LlmError::Timeout(_) => "timeout",
            LlmError::ConnectionReset => "connection_reset",
            LlmError::RateLimited { .. } => "rate_limited",
            LlmError::ServerError { .. } => "server_error",
            LlmError::BadRequest(_) => "bad_request",
            LlmError::Authentication => "authentication",
            LlmError::EmptyResponse { .. } => "empty_response",
            LlmError::InvalidArgument(_) => "invalid_argument",
            LlmError::Other(_) => "other",
        }
    }
}

impl From<EmptyResponse> for LlmError {
    fn from(err: EmptyResponse) -> Self {
        LlmError::EmptyResponse { model: err.model }
    }
}
