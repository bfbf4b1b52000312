//! Mock instrument transport for testing
//!
//! Simulates an instrument without hardware. It provides:
//! - Scripted replies per command
//! - Simulated per-call latency
//! - Controllable failure and panic injection
//! - Call logging for test verification
//!
//! Clones share state, so a test can keep one handle for inspection while the
//! worker owns another.

use super::{CommError, Transport};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct Script {
    replies: HashMap<String, VecDeque<Vec<u8>>>,
    pending_command: Option<String>,
    fail_on: HashSet<String>,
    panic_on: HashSet<String>,
}

/// Mock transport for testing
///
/// # Example
///
/// ```
/// use daq_runner::transport::{MockTransport, Transport};
///
/// # tokio_test::block_on(async {
/// let mut mock = MockTransport::new().with_reply("IDN?", "NEWPORT 1830-C");
/// mock.send(b"IDN?").await.unwrap();
/// assert_eq!(mock.receive(64).await.unwrap(), b"NEWPORT 1830-C");
/// assert_eq!(mock.call_log(), vec!["send:IDN?", "receive"]);
/// # });
/// ```
#[derive(Clone, Debug, Default)]
pub struct MockTransport {
    latency: Arc<Mutex<Duration>>,
    should_fail_next: Arc<AtomicBool>,
    script: Arc<Mutex<Script>>,
    call_log: Arc<Mutex<Vec<String>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    /// Create a mock with no latency and no scripted replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set simulated latency for every send and receive.
    pub fn with_latency(self, latency: Duration) -> Self {
        *lock(&self.latency) = latency;
        self
    }

    /// Queue a reply for `command`. Replies are returned in the order they
    /// were queued; the last one repeats once the queue is down to it.
    pub fn with_reply(self, command: &str, reply: impl Into<Vec<u8>>) -> Self {
        self.push_reply(command, reply);
        self
    }

    /// Queue a reply on an existing handle.
    pub fn push_reply(&self, command: &str, reply: impl Into<Vec<u8>>) {
        lock(&self.script)
            .replies
            .entry(command.to_string())
            .or_default()
            .push_back(reply.into());
    }

    /// Inject a failure for the next operation
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Fail every send of `command`.
    pub fn fail_on(&self, command: &str) {
        lock(&self.script).fail_on.insert(command.to_string());
    }

    /// Panic inside every send of `command`, simulating a crashed worker.
    pub fn panic_on(&self, command: &str) {
        lock(&self.script).panic_on.insert(command.to_string());
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<String> {
        lock(&self.call_log).clone()
    }

    /// Commands sent so far, in order.
    pub fn sent_commands(&self) -> Vec<String> {
        lock(&self.call_log)
            .iter()
            .filter_map(|call| call.strip_prefix("send:").map(str::to_string))
            .collect()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        lock(&self.call_log).clear();
    }

    fn log_call(&self, call: String) {
        lock(&self.call_log).push(call);
    }

    fn check_failure(&self) -> bool {
        self.should_fail_next.swap(false, Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[allow(clippy::panic)]
fn crash_on(command: &str) -> ! {
    panic!("mock transport panic on {command}");
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&mut self, command: &[u8]) -> Result<(), CommError> {
        let command = String::from_utf8_lossy(command).into_owned();
        self.simulate_latency().await;
        self.log_call(format!("send:{command}"));

        let (fail, crash) = {
            let script = lock(&self.script);
            (
                script.fail_on.contains(&command),
                script.panic_on.contains(&command),
            )
        };
        if crash {
            crash_on(&command);
        }
        if self.check_failure() || fail {
            return Err(CommError::Injected(format!("send {command}")));
        }

        lock(&self.script).pending_command = Some(command);
        Ok(())
    }

    async fn receive(&mut self, max_len: usize) -> Result<Vec<u8>, CommError> {
        self.simulate_latency().await;
        self.log_call("receive".to_string());

        if self.check_failure() {
            return Err(CommError::Injected("receive".to_string()));
        }

        let mut script = lock(&self.script);
        let command = script.pending_command.take().ok_or_else(|| {
            CommError::Protocol("receive without a preceding command".to_string())
        })?;

        let mut reply = match script.replies.get_mut(&command) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => format!("MOCK_RESPONSE: {command}").into_bytes(),
        };
        reply.truncate(max_len);
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies_repeat_last() {
        let mut mock = MockTransport::new()
            .with_reply("COUNT?", "2")
            .with_reply("COUNT?", "3");

        for expected in [&b"2"[..], b"3", b"3"] {
            mock.send(b"COUNT?").await.unwrap();
            assert_eq!(mock.receive(8).await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_unscripted_reply_and_truncation() {
        let mut mock = MockTransport::new();
        mock.send(b"PM:POWER?").await.unwrap();
        assert_eq!(mock.receive(5).await.unwrap(), b"MOCK_");
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let mut mock = MockTransport::new();
        mock.inject_next_failure();
        assert!(matches!(mock.send(b"X").await, Err(CommError::Injected(_))));
        // Failure should be consumed
        assert!(mock.send(b"X").await.is_ok());

        mock.fail_on("SHUTTER OPEN");
        assert!(mock.send(b"SHUTTER OPEN").await.is_err());
        assert!(mock.send(b"SHUTTER OPEN").await.is_err());
    }

    #[tokio::test]
    async fn test_receive_without_send() {
        let mut mock = MockTransport::new();
        assert!(matches!(mock.receive(8).await, Err(CommError::Protocol(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_and_shared_log() {
        let observer = MockTransport::new().with_latency(Duration::from_millis(40));
        let mut mock = observer.clone();

        let start = tokio::time::Instant::now();
        mock.send(b"WL 532").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(observer.sent_commands(), vec!["WL 532"]);

        observer.clear_log();
        assert!(mock.call_log().is_empty());
    }
}
