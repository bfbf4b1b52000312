//! Custom error types for the execution engine.
//!
//! This module defines `RunError`, the error type surfaced to whoever drives a
//! measurement run. Lower layers keep their own small error enums
//! ([`ChannelError`](crate::engine::notify::ChannelError),
//! [`BlockError`](crate::engine::block::BlockError),
//! [`CommError`](crate::transport::CommError),
//! [`ProgramError`](crate::program::ProgramError)); they are folded into the
//! run taxonomy at the controller boundary.
//!
//! ## Error Hierarchy
//!
//! - **`SpawnFailure`**: The worker could not be created, or the resources it
//!   needs (notification channel, shared data block) could not be allocated.
//!   Nothing is left allocated when this is returned and no run state exists.
//! - **`TransportFailure`**: Instrument I/O failed inside the worker. The worker
//!   ran its cleanup region and exited normally, carrying the failure in its
//!   exit status.
//! - **`WorkerFault`**: The worker stopped on a non-transport problem such as an
//!   oversized payload or a loop count it could not parse.
//! - **`CrashTermination`**: The worker disappeared without reporting
//!   completion. Always an error, even when nothing else signalled a failure.
//! - **`CancelledByUser`**: A cooperative stop completed. Distinct from a
//!   failure; hosts should show it as a neutral "stopped" status.
//! - **`AlreadyRunning`**: `start` was called while a run is active.
//! - **`Config`**: Wraps configuration loading and validation errors.

use thiserror::Error;

/// Convenience alias for results using the run error type.
pub type RunResult<T> = std::result::Result<T, RunError>;

/// Errors reported by a measurement run.
#[derive(Error, Debug)]
pub enum RunError {
    /// The worker task or its shared resources could not be created.
    #[error("Failed to spawn worker: {0}")]
    SpawnFailure(String),

    /// Instrument communication failed inside the worker.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// The worker stopped on a problem unrelated to the transport.
    #[error("Worker fault: {0}")]
    WorkerFault(String),

    /// The worker vanished without reporting completion.
    #[error("Worker terminated without reporting completion")]
    CrashTermination,

    /// The run was stopped on request.
    #[error("Run stopped by user")]
    CancelledByUser,

    /// A run is already in progress on this controller.
    #[error("A run is already in progress")]
    AlreadyRunning,

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl RunError {
    /// Whether this error should be presented as a failure rather than a
    /// neutral status.
    pub fn is_failure(&self) -> bool {
        !matches!(self, RunError::CancelledByUser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RunError::TransportFailure("power meter timed out".to_string());
        assert_eq!(err.to_string(), "Transport failure: power meter timed out");
    }

    #[test]
    fn test_cancel_is_not_failure() {
        assert!(!RunError::CancelledByUser.is_failure());
        assert!(RunError::CrashTermination.is_failure());
        assert!(RunError::SpawnFailure("no runtime".into()).is_failure());
    }
}
