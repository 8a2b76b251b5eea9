use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Conditions callers branch on. Everything else travels as a plain
/// `anyhow::Error` with context attached.
#[derive(Error, Debug)]
pub enum RockskipError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("indexing of {repo}@{commit} was aborted before completion")]
    IndexingAborted { repo: String, commit: String },

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),
}

impl RockskipError {
    pub fn invalid_pattern(pattern: &str, source: regex::Error) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        }
    }
}

/// First `RockskipError` in the chain of `err`.
pub fn find(err: &anyhow::Error) -> Option<&RockskipError> {
    err.chain().find_map(|cause| cause.downcast_ref::<RockskipError>())
}

/// Returns true if `err` (or anything in its chain) is a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(find(err), Some(RockskipError::Cancelled))
}

/// One failure observed by several callers. The wrapped error stays
/// reachable through `source`, so `find` sees through it.
#[derive(Debug, Clone)]
pub struct SharedError(pub Arc<anyhow::Error>);

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("shared indexing run failed")
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &(dyn std::error::Error + Send + Sync + 'static) = self.0.as_ref().as_ref();
        Some(inner)
    }
}
