//! Error types for the model crate.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors that can occur while converting between rows and entities.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A row or entity could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A value did not have the expected shape.
    #[error("invalid shape for {table}: {reason}")]
    InvalidShape {
        /// Table the value belongs to.
        table: String,
        /// What was wrong.
        reason: String,
    },

    /// A table name is not known.
    #[error("unknown table: {0}")]
    UnknownTable(String),
}
