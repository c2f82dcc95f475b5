//! Error types for the audit crate.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    /// The audit file could not be opened for appending.
    #[error("cannot open audit file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// In-memory storage lock was poisoned.
    #[error("audit storage unavailable: {0}")]
    Storage(String),

    #[error("failed to encode audit event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("audit write failed: {0}")]
    Io(#[from] std::io::Error),
}
