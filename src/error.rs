//! Error types for Tessera.
//!
//! This module provides a unified error type [`TesseraError`] for all engine
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Pass control**: [`TesseraError::StaleRing`] and [`TesseraError::Lockup`]
//!   are the only errors that end a whole pass early.
//! - **Per-device / per-fragment**: not-mounted devices, transfer timeouts,
//!   unreachable peers, digest mismatches and insufficient fragments. These are
//!   recorded in pass statistics and never abort sibling work.
//! - **Async updates**: delivery failures keep the record queued.
//! - **Ring / configuration / IO**: loading and validation failures.
//!
//! # Example
//!
//! ```rust
//! use tessera::error::{Result, TesseraError};
//!
//! fn check_device(mounted: bool) -> Result<()> {
//!     if !mounted {
//!         return Err(TesseraError::NotMounted("sdb1".into()));
//!     }
//!     Ok(())
//! }
//!
//! let err = check_device(false).unwrap_err();
//! assert!(err.is_skip());
//! assert!(!err.aborts_pass());
//! ```

use std::io;
use thiserror::Error;

/// Main error type for Tessera operations.
#[derive(Error, Debug)]
pub enum TesseraError {
    // Device and peer errors
    #[error("Device not mounted: {0}")]
    NotMounted(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Transfer to device {device} timed out after {timeout_ms}ms")]
    TransferTimeout { device: String, timeout_ms: u64 },

    // Pass control errors
    #[error("Ring changed mid-pass: expected version {expected}, found {found}")]
    StaleRing { expected: u64, found: u64 },

    #[error("Lockup detected: no job completed within {0}ms")]
    Lockup(u64),

    // Data errors
    #[error("Insufficient fragments: have {available}, need {required}")]
    InsufficientFragments { available: usize, required: usize },

    #[error("Digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    // Async update errors
    #[error("Queue delivery failed: {0}")]
    QueueDelivery(String),

    // Ring errors
    #[error("Ring load failed: {0}")]
    RingLoad(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Check if the error should be counted as skipped rather than failed.
    pub fn is_skip(&self) -> bool {
        matches!(self, TesseraError::NotMounted(_))
    }

    /// Check if the error ends the whole pass.
    pub fn aborts_pass(&self) -> bool {
        matches!(self, TesseraError::StaleRing { .. } | TesseraError::Lockup(_))
    }

    /// Check if error is retryable on the next pass.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TesseraError::NotMounted(_)
                | TesseraError::PeerUnreachable(_)
                | TesseraError::TransferTimeout { .. }
                | TesseraError::StaleRing { .. }
                | TesseraError::InsufficientFragments { .. }
                | TesseraError::QueueDelivery(_)
        )
    }
}

impl From<bincode::Error> for TesseraError {
    fn from(e: bincode::Error) -> Self {
        TesseraError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for TesseraError {
    fn from(e: serde_json::Error) -> Self {
        TesseraError::Serialization(e.to_string())
    }
}

/// Result type alias for Tessera operations.
pub type Result<T> = std::result::Result<T, TesseraError>;
