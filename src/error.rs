//! Crate-wide error kinds
//!
//! Every public operation surfaces one of these kinds; structural analyzers
//! degrade into partial results with warnings instead of returning errors.

use thiserror::Error;

/// Errors crossing the engine API boundary
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("invalid DAX: {0}")]
    InvalidDax(String),

    #[error("visual not found: {0}")]
    VisualNotFound(String),

    #[error("page not found: {0}")]
    PageNotFound(String),

    #[error("measure not found: {name}")]
    MeasureNotFound {
        name: String,
        /// Closest candidate measure names, best first
        suggestions: Vec<String>,
    },

    #[error("malformed report bundle: {0}")]
    BundleMalformed(String),

    #[error("DMV unavailable: {0}")]
    DmvUnavailable(String),

    #[error("composite key conflict: {0}")]
    CompositeKey(String),

    #[error("query execution timed out: {0}")]
    ExecutorTimeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable kind string for response records
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotConnected(_) => "not_connected",
            EngineError::InvalidDax(_) => "invalid_dax",
            EngineError::VisualNotFound(_) => "visual_not_found",
            EngineError::PageNotFound(_) => "page_not_found",
            EngineError::MeasureNotFound { .. } => "measure_not_found",
            EngineError::BundleMalformed(_) => "bundle_malformed",
            EngineError::DmvUnavailable(_) => "dmv_unavailable",
            EngineError::CompositeKey(_) => "composite_key",
            EngineError::ExecutorTimeout(_) => "executor_timeout",
            EngineError::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::BundleMalformed(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::BundleMalformed(e.to_string())
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(EngineError::NotConnected("x".into()).kind(), "not_connected");
        assert_eq!(
            EngineError::MeasureNotFound { name: "Total".into(), suggestions: vec![] }.kind(),
            "measure_not_found"
        );
    }
}
