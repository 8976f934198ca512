#![forbid(unsafe_code)]
//! Error types for SiltStore.
//!
//! Defines `SiltError` and a `Result<T>` alias used throughout the
//! workspace. Invariant violations (programmer errors) are not represented
//! here; those assert and abort.

use thiserror::Error;

/// Unified error type for all SiltStore cache operations.
#[derive(Debug, Error)]
pub enum SiltError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transaction {txn} conflicted: read set invalidated by a committed transaction")]
    Conflict { txn: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt extent at {addr:#x}: {detail}")]
    Corruption { addr: u64, detail: String },

    #[error("invalid format: {0}")]
    Format(String),

    #[error("replay failed: {0}")]
    Replay(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl SiltError {
    /// Whether the caller should retry with a fresh transaction.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Result alias using `SiltError`.
pub type Result<T> = std::result::Result<T, SiltError>;
