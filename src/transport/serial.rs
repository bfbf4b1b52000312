//! RS-232 / USB-serial transport.
//!
//! Wraps the `serialport` crate. Serial I/O is blocking, so every call runs on
//! Tokio's blocking pool while the port sits behind an `Arc<Mutex<..>>`.

use super::{CommError, Transport};
use async_trait::async_trait;
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Serial transport for line-oriented instruments.
pub struct SerialTransport {
    port_name: String,
    timeout: Duration,
    line_terminator: Vec<u8>,
    response_delimiter: u8,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

impl SerialTransport {
    /// Open `port_name` at `baud_rate` with a `\r\n` terminator and `\n`
    /// reply delimiter.
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> Result<Self, CommError> {
        let port = serialport::new(port_name, baud_rate)
            // Short internal timeout; the overall read deadline is `timeout`.
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| CommError::Io(e.into()))?;
        debug!(port = port_name, baud_rate, "Serial port opened");

        Ok(Self {
            port_name: port_name.to_string(),
            timeout,
            line_terminator: b"\r\n".to_vec(),
            response_delimiter: b'\n',
            port: Arc::new(Mutex::new(port)),
        })
    }

    /// Override the command terminator.
    pub fn with_line_terminator(mut self, terminator: impl Into<Vec<u8>>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Override the reply delimiter.
    pub fn with_response_delimiter(mut self, delimiter: u8) -> Self {
        self.response_delimiter = delimiter;
        self
    }
}

fn join_error(e: tokio::task::JoinError) -> CommError {
    CommError::Protocol(format!("Serial I/O task failed: {e}"))
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.port_name
    }

    async fn send(&mut self, command: &[u8]) -> Result<(), CommError> {
        let mut frame = command.to_vec();
        frame.extend_from_slice(&self.line_terminator);
        let port = Arc::clone(&self.port);

        tokio::task::spawn_blocking(move || -> Result<(), CommError> {
            let mut port = port.blocking_lock();
            port.write_all(&frame)?;
            port.flush()?;
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    async fn receive(&mut self, max_len: usize) -> Result<Vec<u8>, CommError> {
        let port = Arc::clone(&self.port);
        let delimiter = self.response_delimiter;
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || -> Result<Vec<u8>, CommError> {
            let mut port = port.blocking_lock();
            let mut reply = Vec::new();
            let mut byte = [0u8; 1];
            let start = Instant::now();

            while reply.len() < max_len {
                if start.elapsed() > timeout {
                    return Err(CommError::Timeout(timeout));
                }
                match port.read(&mut byte) {
                    Ok(0) => return Err(CommError::Protocol("Unexpected EOF".to_string())),
                    Ok(_) => {
                        reply.push(byte[0]);
                        if byte[0] == delimiter {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                    Err(e) => return Err(CommError::Io(e)),
                }
            }
            Ok(reply)
        })
        .await
        .map_err(join_error)?
    }
}
