//! Result and error types for linecov.

use thiserror::Error;

/// Result type for coverage operations
pub type CoverageResult<T> = Result<T, CoverageError>;

/// Coarse classification of a [`CoverageError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller supplied bad input
    Validation,
    /// Something looked up was not there
    NotFound,
    /// File-system failure
    Io,
    /// Source could not be parsed for instrumentation
    Syntax,
    /// Lifecycle operation called in the wrong state
    InvalidState,
}

/// Errors that can occur in the coverage engine
#[derive(Debug, Error)]
pub enum CoverageError {
    /// Bad line number, bad path, malformed serialized data or configuration
    #[error("Validation error: {message}")]
    Validation {
        /// Error message
        message: String,
    },

    /// Unmapped path or missing file
    #[error("Not found: {message}")]
    NotFound {
        /// Error message
        message: String,
    },

    /// Read/write/rename failure from the file-system layer
    #[error("I/O error while {context}: {source}")]
    Io {
        /// What was being attempted
        context: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Source file cannot be parsed
    #[error("Syntax error in {path}:{line}: {message}")]
    Syntax {
        /// File being instrumented
        path: String,
        /// 1-based line of the problem
        line: u32,
        /// Error message
        message: String,
    },

    /// Invalid state error (operation called in wrong state)
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Error message
        message: String,
    },
}

impl CoverageError {
    /// Create a validation error
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not-found error
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Wrap an I/O error with context
    #[must_use]
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a syntax error
    #[must_use]
    pub fn syntax(path: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        Self::Syntax {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    /// Create an invalid state error
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Io { .. } => ErrorKind::Io,
            Self::Syntax { .. } => ErrorKind::Syntax,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
        }
    }
}

impl From<serde_json::Error> for CoverageError {
    fn from(err: serde_json::Error) -> Self {
        Self::validation(format!("malformed coverage data: {err}"))
    }
}

impl From<serde_yaml_ng::Error> for CoverageError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        Self::validation(format!("malformed configuration: {err}"))
    }
}
