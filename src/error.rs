//! Error types for the query-splitting engine

use thiserror::Error;

/// Main error type for split-query execution
#[derive(Error, Debug)]
pub enum SplitError {
    /// Time range or partition arithmetic error
    #[error("Partition error: {0}")]
    Partition(String),

    /// Invalid time range (from > to)
    #[error("Invalid time range: from {from} > to {to}")]
    InvalidTimeRange {
        /// Range start in milliseconds
        from: i64,
        /// Range end in milliseconds
        to: i64,
    },

    /// Shard resolution or batching error
    #[error("Shard error: {0}")]
    Shard(String),

    /// Transport-level failure of a sub-request
    ///
    /// Any executor failure is treated as fatal for the run; transient
    /// backend conditions are reported inside `QueryResponse::errors`
    /// instead and classified by the retry policy.
    #[error("Subquery transport error: {0}")]
    Transport(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The run was cancelled by the caller
    #[error("Query cancelled")]
    Cancelled,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, SplitError>;
