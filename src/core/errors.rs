use std::path::PathBuf;
use std::time::Duration;

/// A rule override source exists but could not be turned into a valid RuleSet.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("cannot read override source {path:?}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("override source {path:?} is not a JSON object of numbers: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown rule parameter: {0}")]
    UnknownKey(String),

    #[error("invalid rule value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("insufficient history: need at least {required} observations, got {available}")]
pub struct InsufficientHistoryError {
    pub required: usize,
    pub available: usize,
}

/// Anything that keeps the refinement backend from returning usable histograms.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("refinement backend unavailable: {0}")]
    Unavailable(String),

    #[error("refinement backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("refinement backend returned {got} histograms for {expected} descriptors")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("record cannot be encoded: {0}")]
    InvalidRecord(String),
}
