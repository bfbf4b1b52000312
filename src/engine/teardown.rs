//! Exactly-once release of the run's shared resources, plus liveness.
//!
//! Either side may be the last one standing: the controller after it has seen
//! the worker terminate, or the worker after it has noticed the controller is
//! gone. Both hold a clone of the same [`Teardown`]; whichever calls
//! [`Teardown::release`] first frees the notification channel and the data
//! block, later calls are no-ops.
//!
//! "The other side is gone" is never inferred from a full queue. Each side
//! owns a [`LivenessGuard`] whose drop closes a `watch` channel that the peer
//! can check or await through [`Liveness`].

use crate::engine::block::BlockRelease;
use crate::engine::notify::ChannelRelease;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Which side performed the release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The controller, after observing worker termination.
    Controller,
    /// The worker, after observing that the controller is gone.
    Worker,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Controller => write!(f, "controller"),
            Side::Worker => write!(f, "worker"),
        }
    }
}

/// Held by one side; dropping it tells the peer this side is gone.
#[derive(Debug)]
pub struct LivenessGuard {
    _tx: watch::Sender<()>,
}

/// Peer-side view of a [`LivenessGuard`].
#[derive(Debug, Clone)]
pub struct Liveness {
    rx: watch::Receiver<()>,
}

/// Create a liveness pair.
pub fn liveness() -> (LivenessGuard, Liveness) {
    let (tx, rx) = watch::channel(());
    (LivenessGuard { _tx: tx }, Liveness { rx })
}

impl Liveness {
    /// Non-blocking check.
    pub fn is_peer_alive(&self) -> bool {
        self.rx.has_changed().is_ok()
    }

    /// Resolve once the guard has been dropped.
    pub async fn peer_gone(&self) {
        let mut rx = self.rx.clone();
        // Nothing is ever sent, so `changed` only returns on close.
        while rx.changed().await.is_ok() {}
    }
}

#[derive(Debug)]
struct TeardownInner {
    released: AtomicBool,
    channel: ChannelRelease,
    block: BlockRelease,
}

/// Shared, idempotent release of the channel and the data block.
#[derive(Debug, Clone)]
pub struct Teardown {
    inner: Arc<TeardownInner>,
}

impl Teardown {
    /// Bundle the release handles of one run.
    pub fn new(channel: ChannelRelease, block: BlockRelease) -> Self {
        Self {
            inner: Arc::new(TeardownInner {
                released: AtomicBool::new(false),
                channel,
                block,
            }),
        }
    }

    /// Release everything. Returns `true` only for the call that did the work.
    pub fn release(&self, by: Side) -> bool {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.channel.close();
        self.inner.block.free();
        debug!(by = %by, "Run resources released");
        true
    }

    /// Whether the release has happened.
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }
}

impl Drop for TeardownInner {
    fn drop(&mut self) {
        // Last holder gone without an explicit release, e.g. both sides
        // exited between each other's liveness checks.
        if !self.released.swap(true, Ordering::SeqCst) {
            self.channel.close();
            self.block.free();
            debug!("Run resources released on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::block::DataBlockManager;
    use crate::engine::notify;
    use std::time::Duration;

    fn teardown() -> (Teardown, ChannelRelease, BlockRelease) {
        let (_tx, rx) = notify::channel(4).unwrap();
        let (_writer, reader) = DataBlockManager::allocate(16, None).unwrap();
        let channel = rx.release_handle();
        let block = reader.release_handle();
        (Teardown::new(channel.clone(), block.clone()), channel, block)
    }

    #[test]
    fn test_release_exactly_once() {
        let (teardown, channel, block) = teardown();
        let other = teardown.clone();

        assert!(teardown.release(Side::Controller));
        assert!(!other.release(Side::Worker));
        assert!(!teardown.release(Side::Controller));
        assert!(other.is_released());
        assert!(channel.is_closed());
        assert!(block.is_freed());
    }

    #[test]
    fn test_concurrent_release_single_winner() {
        let (teardown, _, _) = teardown();
        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let t = teardown.clone();
                    let side = if i % 2 == 0 { Side::Controller } else { Side::Worker };
                    s.spawn(move || t.release(side))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_dropping_last_handle_releases() {
        let (teardown, channel, block) = teardown();
        let other = teardown.clone();
        drop(teardown);
        assert!(!block.is_freed());
        drop(other);
        assert!(channel.is_closed());
        assert!(block.is_freed());
    }

    #[tokio::test]
    async fn test_liveness_check_and_await() {
        let (guard, liveness) = liveness();
        assert!(liveness.is_peer_alive());

        let waiter = tokio::spawn({
            let liveness = liveness.clone();
            async move { liveness.peer_gone().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!liveness.is_peer_alive());
    }
}
