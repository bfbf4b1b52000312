//! Cancellable wait primitive for the worker.
//!
//! A [`CancelToken`] is shared between the controller (which requests
//! cancellation) and the worker (which sleeps on it). The wait and the
//! cancellation race through a single "resume-armed" flag:
//!
//! 1. The waiter registers for a wake, then sets `armed`.
//! 2. Whoever clears `armed` first with a compare-and-swap owns the resume.
//!    The timer path clears it and returns `Expired`; the cancel path clears
//!    it and wakes the waiter, which returns `Cancelled`.
//! 3. The loser sees `armed == false` and does nothing.
//!
//! Cancellation is sticky for the lifetime of the token, so a request that
//! lands before a wait starts makes that wait (and every later one) return
//! `Cancelled` immediately.
//!
//! While the worker runs its cleanup region the token is *shielded*: requests
//! are still recorded, but they no longer disarm or wake a wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Why a [`CancelToken::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WokeBy {
    /// The full duration elapsed.
    Expired,
    /// A cancellation request ended the wait early.
    Cancelled,
}

#[derive(Debug, Default)]
struct CancelState {
    requested: AtomicBool,
    armed: AtomicBool,
    shielded: AtomicBool,
    wake: Notify,
}

/// Shared cancellation flag with an interruptible sleep.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

impl CancelToken {
    /// Create a token with no cancellation requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    ///
    /// Returns `true` for the first request and `false` for every repeat, so
    /// callers can treat repeated stop requests as no-ops.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.requested.swap(true, Ordering::SeqCst);
        if !self.inner.shielded.load(Ordering::SeqCst) && self.disarm() {
            self.inner.wake.notify_one();
        }
        first
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Stop cancellation from interrupting waits. Used on entry to the
    /// cleanup region; there is no way back.
    pub(crate) fn shield(&self) {
        self.inner.shielded.store(true, Ordering::SeqCst);
    }

    /// Whether waits currently ignore cancellation.
    pub fn is_shielded(&self) -> bool {
        self.inner.shielded.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless cancelled first.
    pub async fn wait(&self, duration: Duration) -> WokeBy {
        if self.is_shielded() {
            tokio::time::sleep(duration).await;
            return WokeBy::Expired;
        }

        let deadline = Instant::now() + duration;
        loop {
            let notified = self.inner.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.inner.armed.store(true, Ordering::SeqCst);
            if self.inner.requested.load(Ordering::SeqCst) {
                // Requested before we blocked. If the canceller has not reached
                // its compare-and-swap yet, clearing the flag here makes it skip
                // the wake.
                self.disarm();
                return WokeBy::Cancelled;
            }

            tokio::select! {
                biased;
                () = &mut notified => {
                    if self.inner.requested.load(Ordering::SeqCst) {
                        return WokeBy::Cancelled;
                    }
                    // Leftover permit from an earlier race; wait out the rest.
                }
                () = tokio::time::sleep_until(deadline) => {
                    if self.disarm() {
                        return WokeBy::Expired;
                    }
                    // The canceller cleared the flag first and owns this resume.
                    return WokeBy::Cancelled;
                }
            }
        }
    }

    fn disarm(&self) -> bool {
        self.inner
            .armed
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
