//! Query error types.

use datafusion::error::DataFusionError;

/// Result alias for query operations.
pub type Result<T> = std::result::Result<T, QueryError>;

/// Errors surfaced to query callers.
///
/// No partial results are returned alongside an error.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The request itself is malformed (bad SQL, unknown field, bad filter).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The engine failed while executing a well-formed query.
    #[error("query execution failed: {0}")]
    Execution(String),

    /// Reading artifacts from the data directory failed.
    #[error("storage error: {0}")]
    Storage(#[from] strata_core::Error),
}

impl QueryError {
    /// Creates a bad-request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// Creates an execution error.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    /// Returns true if the caller is at fault.
    #[must_use]
    pub const fn is_bad_request(&self) -> bool {
        matches!(self, Self::BadRequest(_))
    }
}

/// Maps engine errors: SQL, plan and schema problems are the caller's fault.
pub(crate) fn map_datafusion_error(err: &DataFusionError) -> QueryError {
    match err {
        DataFusionError::SQL(_, _)
        | DataFusionError::Plan(_)
        | DataFusionError::SchemaError(_, _) => QueryError::bad_request(err.to_string()),
        _ => QueryError::execution(err.to_string()),
    }
}
