//! Error types for the sync engine
//!
//! Errors stay inside the engine: every sync cycle converts them into counters
//! and log lines. `SyncError` is what the storage and cache layers return.

use thiserror::Error;

use crate::dmf::SubmitError;
use crate::model::DmfStatus;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A cache row that cannot be mapped onto the typed model
    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Illegal status transition: {from} -> {to}")]
    IllegalTransition { from: DmfStatus, to: DmfStatus },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Submit(#[from] SubmitError),
}

pub type Result<T> = std::result::Result<T, SyncError>;
