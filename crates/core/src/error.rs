//! Error types for the chain engine
//!
//! One unified `Error` enum is used across all crates, with `thiserror`
//! providing `Display` and `Error` implementations.
//!
//! ## Policy
//!
//! - Per-record errors inside a batch are accumulated and returned; they
//!   never abort the batch.
//! - Store-level errors (`Io`, `Corrupt`) are logged and returned to the
//!   caller; a corrupt snapshot starts the store empty and keeps the file.
//! - Worker crashes are recovered by the pool supervisor; the failing task
//!   surfaces as `Worker` to its submitter.
//! - Nothing here is fatal to the process.

use crate::types::TenantId;
use std::io;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the chain engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad configuration, empty prefix, non-positive weight, or a
    /// malformed record. Not retryable; fix the input.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// What is wrong with the input.
        message: String,
    },

    /// Tenant without a snapshot on an explicit load-only path.
    ///
    /// Normal `get` paths create an empty store instead.
    #[error("no snapshot for tenant {tenant}")]
    NotFound {
        /// The tenant that has no snapshot.
        tenant: TenantId,
    },

    /// Snapshot header mismatch or malformed body. Non-fatal: the store
    /// starts empty and the bad file is left for operator inspection.
    #[error("corrupt snapshot: {message}")]
    Corrupt {
        /// Description of the corruption.
        message: String,
    },

    /// The per-tenant training lock is held by a live process.
    #[error("training already in progress for tenant {tenant} (pid {pid})")]
    Contention {
        /// The tenant whose lock is held.
        tenant: TenantId,
        /// PID recorded in the lock file (0 if unreadable).
        pid: u32,
    },

    /// Task cancelled before dispatch, or the pool shut down while the
    /// task was still queued.
    #[error("task cancelled before dispatch")]
    Cancelled,

    /// A task failed inside a worker; wraps the underlying cause.
    #[error("worker task failed: {message}")]
    Worker {
        /// Description of the failure.
        message: String,
    },

    /// Filesystem failure during load or save.
    #[error("io error: {message}")]
    Io {
        /// What the engine was doing when the failure occurred.
        message: String,
        /// Underlying OS error, when available.
        #[source]
        source: Option<io::Error>,
    },
}

impl Error {
    /// Create an `InvalidInput` error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Error::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a `NotFound` error.
    pub fn not_found(tenant: TenantId) -> Self {
        Error::NotFound { tenant }
    }

    /// Create a `Corrupt` error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Error::Corrupt {
            message: message.into(),
        }
    }

    /// Create a `Contention` error.
    pub fn contention(tenant: TenantId, pid: u32) -> Self {
        Error::Contention { tenant, pid }
    }

    /// Create a `Worker` error.
    pub fn worker(message: impl Into<String>) -> Self {
        Error::Worker {
            message: message.into(),
        }
    }

    /// Create an `Io` error with context.
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Check if this is a validation error.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Error::InvalidInput { .. })
    }

    /// Check if this is a missing-snapshot error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Check if this is a corruption error.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Error::Corrupt { .. })
    }

    /// Check if this is a lock-contention error.
    ///
    /// Contention is retryable once the holder finishes or dies.
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::Contention { .. })
    }

    /// Check if this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Check if this is a worker-side task failure.
    pub fn is_worker(&self) -> bool {
        matches!(self, Error::Worker { .. })
    }

    /// Check if this is a filesystem error.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io { .. })
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io {
            message: e.to_string(),
            source: Some(e),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Corrupt {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_invalid_input() {
        let e = Error::invalid_input("weight must be >= 1");
        let msg = e.to_string();
        assert!(msg.contains("invalid input"));
        assert!(msg.contains("weight must be >= 1"));
        assert!(e.is_invalid_input());
    }

    #[test]
    fn test_display_not_found() {
        let e = Error::not_found(TenantId::new("g1"));
        assert!(e.to_string().contains("g1"));
        assert!(e.is_not_found());
    }

    #[test]
    fn test_display_contention() {
        let e = Error::contention(TenantId::new("g1"), 4242);
        let msg = e.to_string();
        assert!(msg.contains("training already in progress"));
        assert!(msg.contains("4242"));
        assert!(e.is_contention());
    }

    #[test]
    fn test_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let e: Error = io_err.into();
        assert!(e.is_io());
        assert!(e.to_string().contains("access denied"));
    }

    #[test]
    fn test_from_serde_json() {
        let result: std::result::Result<TenantId, _> = serde_json::from_str("{nope");
        let e: Error = result.unwrap_err().into();
        assert!(e.is_corrupt());
    }

    #[test]
    fn test_classification_disjoint() {
        let e = Error::Cancelled;
        assert!(e.is_cancelled());
        assert!(!e.is_worker());
        assert!(!e.is_io());

        let e = Error::worker("sampling panicked");
        assert!(e.is_worker());
        assert!(!e.is_cancelled());
    }
}
