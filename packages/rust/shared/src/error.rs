//! Error types for ccbench.
//!
//! Library crates use [`CcbenchError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all ccbench operations.
#[derive(Debug, thiserror::Error)]
pub enum CcbenchError {
    /// Configuration loading or validation error. Always fatal, always pre-run.
    #[error("config error: {message}")]
    Config { message: String },

    /// Corpus/manifest/llms.txt parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Network/HTTP error outside the classified inference taxonomy
    /// (e.g. failure to construct the HTTP client).
    #[error("network error: {0}")]
    Network(String),

    /// Result-store or checkpoint persistence error.
    #[error("store error: {0}")]
    Store(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CcbenchError>;

impl CcbenchError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a store error from any displayable message.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = CcbenchError::config("models list is empty");
        assert_eq!(err.to_string(), "config error: models list is empty");

        let err = CcbenchError::validation("duplicate question_id Q003");
        assert!(err.to_string().contains("Q003"));
    }
}
