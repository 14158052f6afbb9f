//! Error types for the sync engine.

use casesync_model::{ModelError, Table};
use casesync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No usable remote client. Terminal until reconfigured.
    #[error("remote not configured: {0}")]
    Configuration(String),

    /// The remote is missing an expected table. Terminal until provisioned.
    #[error("remote schema missing table {table}")]
    Schema {
        /// The missing table.
        table: String,
    },

    /// Network or remote failure.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A push step failed on a specific table.
    #[error("push failed on {table}: {source}")]
    Table {
        /// Table being pushed when the failure happened.
        table: Table,
        /// Underlying failure.
        #[source]
        source: Box<SyncError>,
    },

    /// Attachment content is absent.
    #[error("content missing for document {document_id}")]
    ContentMissing {
        /// Affected document.
        document_id: String,
    },

    /// Local store error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Model error.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// Encoding or decoding of a persisted or remote value failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// A sync cycle is already running.
    #[error("a sync is already in progress")]
    AlreadySyncing,

    /// The background scheduler is not running.
    #[error("scheduler stopped")]
    SchedulerStopped,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Tags an error with the table whose push step failed.
    pub fn on_table(self, table: Table) -> Self {
        Self::Table {
            table,
            source: Box::new(self),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Table { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// The table a push failure originated from, if any.
    pub fn table(&self) -> Option<Table> {
        match self {
            SyncError::Table { table, .. } => Some(*table),
            _ => None,
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for SyncError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        SyncError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for SyncError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        SyncError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Codec(e.to_string())
    }
}
