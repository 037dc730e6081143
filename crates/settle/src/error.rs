//! Convergence engine error types

use std::time::Duration;
use thiserror::Error;

/// Error reported by the remote API for a describe or mutate call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ApiError {
    /// Backend error code (e.g. "InvalidVolume.NotFound")
    pub code: String,

    /// Human-readable message from the backend
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether the code matches any of `codes`
    pub fn code_in<S: AsRef<str>>(&self, codes: &[S]) -> bool {
        codes.iter().any(|c| c.as_ref() == self.code)
    }
}

/// Convergence engine errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("Resource not found: {message}")]
    NotFound {
        message: String,
        #[source]
        last_error: Option<Box<Error>>,
    },

    #[error("Too many results: query matched {count} resources, expected exactly one")]
    TooMany { count: usize },

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Unexpected state '{}', wanted one of: {}", .state, .expected.join(", "))]
    UnexpectedState {
        state: String,
        expected: Vec<String>,
        #[source]
        last_error: Option<Box<Error>>,
    },

    #[error("Resource reached failure state '{}'{}", .state, reason_suffix(.reason))]
    FailureState {
        state: String,
        reason: Option<String>,
    },

    #[error(
        "Timeout while waiting for state to become '{}' (last state: '{}', timeout: {:?})",
        .expected.join(", "),
        .last_state.as_deref().unwrap_or(""),
        .timeout
    )]
    TimedOut {
        timeout: Duration,
        last_state: Option<String>,
        expected: Vec<String>,
        #[source]
        last_error: Option<Box<Error>>,
    },

    #[error("Resource still exists: {0}")]
    StillExists(String),

    #[error("Resource has no identifier: {0}")]
    MissingId(String),

    #[error("Invalid wait spec: {0}")]
    InvalidWaitSpec(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(r) if !r.is_empty() => format!(": {}", r),
        _ => String::new(),
    }
}

impl Error {
    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound {
            message: message.into(),
            last_error: None,
        }
    }

    /// Not found, caused by a backend error such as an "unknown ID" code
    pub fn not_found_from(message: impl Into<String>, cause: Error) -> Self {
        Error::NotFound {
            message: message.into(),
            last_error: Some(Box::new(cause)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Error::TimedOut { .. })
    }

    /// Backend error code, if this is (or wraps) an API error
    pub fn api_code(&self) -> Option<&str> {
        match self {
            Error::Api(e) => Some(e.code.as_str()),
            Error::NotFound {
                last_error: Some(e),
                ..
            }
            | Error::TimedOut {
                last_error: Some(e),
                ..
            } => e.api_code(),
            _ => None,
        }
    }

    /// Attach the last refresh error to a timeout or unexpected-state error
    pub fn with_last_error(self, cause: Option<Error>) -> Self {
        let Some(cause) = cause else {
            return self;
        };
        match self {
            Error::TimedOut {
                timeout,
                last_state,
                expected,
                last_error: None,
            } => Error::TimedOut {
                timeout,
                last_state,
                expected,
                last_error: Some(Box::new(cause)),
            },
            Error::UnexpectedState {
                state,
                expected,
                last_error: None,
            } => Error::UnexpectedState {
                state,
                expected,
                last_error: Some(Box::new(cause)),
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
