//! Result and error types for codecbench.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for codecbench operations
pub type BenchResult<T> = Result<T, BenchError>;

/// Errors that can occur while exercising a codec
#[derive(Debug, Error)]
pub enum BenchError {
    /// Test definition is missing something the run needs
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Codec session could not be opened
    #[error("Failed to open {codec} session: {message}")]
    SessionCreateFailed {
        /// Codec identity that was requested
        codec: String,
        /// Error message
        message: String,
    },

    /// Codec session failed after it was opened
    #[error("Codec session error: {message}")]
    Session {
        /// Error message
        message: String,
    },

    /// A completion arrived with nothing pending
    #[error("No pending frame for completion at pts {pts}")]
    CorrelationMiss {
        /// Presentation timestamp reported by the codec
        pts: i64,
    },

    /// Active task registry failure
    #[error("Task registry error: {message}")]
    Registry {
        /// Error message
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BenchError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a session-open error
    pub fn session_create(codec: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SessionCreateFailed {
            codec: codec.into(),
            message: message.into(),
        }
    }

    /// Create a session error
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    /// Create an I/O error from a message
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(std::io::Error::other(message.into()))
    }

    /// Create a registry error
    pub fn registry(message: impl Into<String>) -> Self {
        Self::Registry {
            message: message.into(),
        }
    }

    /// Failure category used in task outcomes
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Configuration { .. } => FailureKind::Configuration,
            Self::SessionCreateFailed { .. } | Self::Session { .. } => FailureKind::Session,
            Self::Io(_) | Self::Json(_) => FailureKind::Io,
            Self::CorrelationMiss { .. } | Self::Registry { .. } => FailureKind::Internal,
        }
    }
}

/// Category of a test failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Missing codec, unreachable source, bad parameters
    Configuration,
    /// Session open, configure or submit failure
    Session,
    /// Source or sink failure
    Io,
    /// Harness fault (panic, lost task)
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "configuration",
            Self::Session => "session",
            Self::Io => "io",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// A failure flattened so it can cross task boundaries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    /// Failure category
    pub kind: FailureKind,
    /// Human readable message
    pub message: String,
}

impl TestFailure {
    /// Create a failure
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&BenchError> for TestFailure {
    fn from(err: &BenchError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
