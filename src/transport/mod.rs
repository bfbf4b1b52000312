//! Instrument transport abstraction.
//!
//! The worker talks to instruments only through [`Transport`]. Any
//! [`CommError`] is fatal for the run: the worker stops the main body, runs
//! the cleanup region and reports the failure in its exit status.

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use mock::MockTransport;
#[cfg(feature = "instrument_serial")]
pub use serial::SerialTransport;

/// Errors raised by a transport.
#[derive(Error, Debug)]
pub enum CommError {
    /// The link is not open.
    #[error("Transport not connected")]
    NotConnected,

    /// No complete reply within the read timeout.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The instrument answered with something unusable.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Failure produced by a test double.
    #[error("Injected failure: {0}")]
    Injected(String),
}

/// Byte-level link to an instrument.
///
/// Calls are made one at a time by the worker; an implementation never sees
/// concurrent requests.
#[async_trait]
pub trait Transport: Send {
    /// Short name for logs.
    fn name(&self) -> &str {
        "transport"
    }

    /// Send a command.
    async fn send(&mut self, command: &[u8]) -> Result<(), CommError>;

    /// Read one reply of at most `max_len` bytes.
    async fn receive(&mut self, max_len: usize) -> Result<Vec<u8>, CommError>;
}
