// ABOUTME: Typed error taxonomy for credential resolution, upstream calls and writes
// ABOUTME: Separates transport-level ApiError from the DigestError surfaced to callers

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, DigestError>;

/// Result type returned by upstream transports.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Errors surfaced by the core to front ends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DigestError {
    /// No usable credential, unknown workspace id, or invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The retry budget was exhausted (or the upstream could not be reached).
    #[error(
        "upstream unavailable after {attempts} attempt(s), retry later{}",
        retry_hint(.retry_after)
    )]
    UpstreamUnavailable {
        attempts: u32,
        retry_after: Option<Duration>,
    },

    /// Non-retryable upstream rejection.
    #[error("upstream error ({status}): {message}")]
    Upstream { status: String, message: String },

    /// A write may or may not have been applied upstream.
    #[error("outcome of {operation} is unknown: {message}; check the conversation before retrying")]
    WriteAmbiguous {
        operation: &'static str,
        message: String,
    },

    /// A named conversation or person could not be resolved.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// The caller passed an argument the operation cannot use.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(wait) => format!(" (server advised {}s)", wait.as_secs().max(1)),
        None => String::new(),
    }
}

impl DigestError {
    #[must_use]
    pub fn configuration(message: impl std::fmt::Display) -> Self {
        Self::Configuration(message.to_string())
    }

    #[must_use]
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound {
            what: what.to_string(),
        }
    }

    #[must_use]
    pub fn invalid_input(message: impl std::fmt::Display) -> Self {
        Self::InvalidInput(message.to_string())
    }

    /// Stable classification used in diagnostics and metrics labels.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            Self::Upstream { .. } => ErrorKind::Upstream,
            Self::WriteAmbiguous { .. } => ErrorKind::WriteAmbiguous,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }
}

/// Failure reported by a `WorkspaceApi` implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The upstream asked us to slow down.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// The upstream answered with an error (bad scope, unknown channel, ...).
    #[error("{status}: {message}")]
    Rejected { status: String, message: String },

    /// The request failed in transit. `sent` is false only when the request
    /// provably never left this process (e.g. connection refused).
    #[error("transport failure: {message}")]
    Transport { message: String, sent: bool },
}

impl ApiError {
    #[must_use]
    pub fn rejected(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            status: status.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            sent: true,
        }
    }

    #[must_use]
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            sent: false,
        }
    }
}

/// Serializable error classification attached to diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    UpstreamUnavailable,
    Upstream,
    WriteAmbiguous,
    NotFound,
    InvalidInput,
    DeadlineExceeded,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::Upstream => "upstream",
            Self::WriteAmbiguous => "write_ambiguous",
            Self::NotFound => "not_found",
            Self::InvalidInput => "invalid_input",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
