//! Error types for the fledge library.
//!
//! This module defines the error taxonomy for process lifecycle operations.
//! Precondition violations (wrong state, malformed parameters) are rejected
//! before any OS call is made; everything else wraps the underlying
//! `std::io::Error` from the failed syscall.

use crate::status::Status;
use thiserror::Error;

/// Main error type for fledge operations.
#[derive(Debug, Error)]
pub enum FledgeError {
    /// An operation was called in a lifecycle state that does not permit it.
    #[error("cannot {operation} while process is {status}")]
    InvalidState {
        operation: &'static str,
        status: Status,
    },

    /// Start parameters failed validation (empty argv, embedded NUL bytes).
    #[error("invalid start parameters: {message}")]
    InvalidParams { message: String },

    /// Creating or configuring a pipe failed.
    #[error("pipe setup failed: {message}")]
    Pipe {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Creating the child process failed.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting for readiness or reading child output failed.
    #[error("output collection failed: {message}")]
    Collect {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting for process termination failed.
    #[error("failed to wait for process {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    /// Forcibly terminating the process failed.
    #[error("failed to kill process {pid}: {source}")]
    Kill {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for fledge operations.
pub type Result<T> = std::result::Result<T, FledgeError>;

impl From<std::io::Error> for FledgeError {
    fn from(err: std::io::Error) -> Self {
        FledgeError::Collect {
            message: err.to_string(),
            source: err,
        }
    }
}

impl FledgeError {
    /// Create a pipe error with context about which pipe failed.
    pub fn pipe(message: impl Into<String>, err: std::io::Error) -> Self {
        FledgeError::Pipe {
            message: message.into(),
            source: err,
        }
    }

    /// Create a collection error with context about which stream failed.
    pub fn collect(message: impl Into<String>, err: std::io::Error) -> Self {
        FledgeError::Collect {
            message: message.into(),
            source: err,
        }
    }

    /// True if this error is a precondition violation that left the process
    /// untouched (the caller may correct the input and retry).
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            FledgeError::InvalidState { .. } | FledgeError::InvalidParams { .. }
        )
    }
}
