//! Error types for the cohort consensus core.
//!
//! This module provides a unified error type [`CohortError`] for all cohort
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Consensus**: role/term violations surfaced by the node state machine
//! - **Log**: append/fetch failures in the log facade
//! - **WAL**: sink availability, sequencing, and recovery failures
//! - **Configuration**: invalid settings
//!
//! Most handler-level anomalies (stale terms, failed consistency checks) are
//! ordinary reply values, not errors; `CohortError` is reserved for faults
//! the caller has to act on.

use std::io;
use thiserror::Error;

/// Main error type for cohort operations.
#[derive(Error, Debug)]
pub enum CohortError {
    // Consensus errors
    #[error("Not the leader. Leader is: {leader:?}")]
    NotLeader { leader: Option<u64> },

    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    #[error("Cluster change rejected: {0}")]
    ClusterChangeRejected(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(u64),

    // Log errors
    #[error("Log error: {0}")]
    Log(String),

    #[error("Entry not found at index {0}")]
    EntryNotFound(u64),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    // WAL errors
    #[error("WAL is down")]
    WalDown,

    #[error("WAL record corrupt: {0}")]
    WalCorrupt(String),

    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    // Configuration errors
    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CohortError {
    /// Check if error is retryable by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CohortError::NotLeader { .. } | CohortError::WalDown)
    }

    /// Check if error is fatal to the hosting process.
    ///
    /// Fatal errors indicate either a consensus safety violation or durable
    /// storage that can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CohortError::SafetyViolation(_)
                | CohortError::WalCorrupt(_)
                | CohortError::ChecksumMismatch { .. }
        )
    }
}

impl From<bincode::Error> for CohortError {
    fn from(e: bincode::Error) -> Self {
        CohortError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CohortError {
    fn from(e: serde_json::Error) -> Self {
        CohortError::Serialization(e.to_string())
    }
}

/// Result type alias for cohort operations.
pub type Result<T> = std::result::Result<T, CohortError>;
