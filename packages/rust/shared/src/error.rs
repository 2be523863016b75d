//! Error types for pricewatch.
//!
//! Library crates use [`PricewatchError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Per-item lookup failures are *not* errors at this level: they are recorded
//! as a [`LookupStatus`](crate::LookupStatus) on the ledger. Only failures that
//! stop a whole run (or a whole command) surface as a `PricewatchError`.

use std::path::PathBuf;

/// Top-level error type for all pricewatch operations.
#[derive(Debug, thiserror::Error)]
pub enum PricewatchError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A run could not be set up (no input data, no sources selected, ...).
    /// Raised before any pipeline starts.
    #[error("setup error: {message}")]
    Setup { message: String },

    /// Data validation error (unknown item key, malformed input, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Network/HTTP error while building a lookup session.
    #[error("network error: {0}")]
    Network(String),

    /// HTML parsing or selector error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// A lookup session could not be obtained.
    #[error("lookup error: {0}")]
    Lookup(String),

    /// The run task itself stopped without producing an outcome.
    #[error("run failed: {0}")]
    Run(String),

    /// A run is still live; the requested control operation is refused.
    #[error("a run is already in progress (started {elapsed_secs}s ago)")]
    RunInProgress { elapsed_secs: u64 },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PricewatchError>;

impl PricewatchError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a setup error from any displayable message.
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup {
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

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error happened during run setup.
    pub fn is_setup(&self) -> bool {
        matches!(self, Self::Setup { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = PricewatchError::setup("no sources selected");
        assert_eq!(err.to_string(), "setup error: no sources selected");
        assert!(err.is_setup());

        let err = PricewatchError::validation("duplicate item key 779");
        assert!(err.to_string().contains("duplicate item key"));
        assert!(!err.is_setup());
    }

    #[test]
    fn run_in_progress_mentions_age() {
        let err = PricewatchError::RunInProgress { elapsed_secs: 42 };
        assert!(err.to_string().contains("42s"));
    }
}
