//! Error types for ledger operations

use crate::chain::ChainError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur while appending to or reading the ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to create or open the ledger file
    #[error("Failed to open ledger file: {path}")]
    CreateFailed { path: PathBuf },

    /// The backend refused or lost the append
    #[error("Failed to append to ledger: {0}")]
    AppendFailed(String),

    /// A persisted line could not be parsed back into an entry
    #[error("Corrupted ledger entry at line {line}: {reason}")]
    Corrupted { line: usize, reason: String },

    /// Chain verification found a broken link
    #[error("Chain verification failed: {0}")]
    Chain(#[from] ChainError),

    /// Requested sequence range is outside the committed chain
    #[error("Sequence range {from}..={to} is out of bounds (ledger length {len})")]
    RangeOutOfBounds { from: u64, to: u64, len: u64 },

    /// HMAC secret environment variable missing
    #[error("{0} environment variable not set")]
    MissingSecret(String),

    /// HMAC secret present but unusable
    #[error("Invalid ledger secret: {0}")]
    InvalidSecret(String),
}

impl LedgerError {
    /// Create an append failed error
    pub fn append_failed<S: Into<String>>(message: S) -> Self {
        LedgerError::AppendFailed(message.into())
    }

    /// Create a corrupted entry error
    pub fn corrupted(line: usize, reason: &str) -> Self {
        LedgerError::Corrupted {
            line,
            reason: reason.to_string(),
        }
    }

    /// Create a create failed error
    pub fn create_failed<P: Into<PathBuf>>(path: P) -> Self {
        LedgerError::CreateFailed { path: path.into() }
    }
}
