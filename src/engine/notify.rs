//! Bounded worker → controller notification channel.
//!
//! Records live in a fixed-capacity single-producer/single-consumer ring
//! (`ringbuf`). Two wake primitives sit next to it:
//!
//! - a semaphore counting *free* slots, which the producer must acquire before
//!   pushing, so a full ring stalls the worker instead of dropping a record;
//! - a pending counter plus a [`Notify`], which is the whole of the delivery
//!   path: the producer bumps the counter and wakes the consumer, nothing more.
//!
//! The consumer side never awaits in [`NotificationReceiver::try_recv`]; that is
//! what the controller's drain step calls.

use crate::engine::state::ExitStatus;
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};

/// Errors raised by the notification channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Capacity must be at least one record.
    #[error("Notification channel capacity must be non-zero")]
    ZeroCapacity,

    /// The ring or its slot counter cannot hold this many records.
    #[error("Could not allocate a notification ring of {capacity} records")]
    Alloc { capacity: usize },

    /// The channel was released by teardown.
    #[error("Notification channel closed")]
    Closed,

    /// A push found the ring full despite holding a slot permit.
    #[error("Notification ring overflowed; slot accounting is broken")]
    Overflow,
}

/// What happened on the worker side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    /// Handshake: the worker is up and waiting for the controller's ack.
    Started,
    /// The shared data block holds a filled payload.
    DataReady,
    /// The worker observed a cancellation request at a safe point.
    CancelAck,
    /// Terminal record. Nothing follows it.
    WorkerDone(ExitStatus),
}

/// One record in the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Position in the stream, starting at 1.
    pub sequence: u64,
    /// Event carried by this record.
    pub kind: NotificationKind,
}

#[derive(Debug)]
struct Signal {
    free_slots: Semaphore,
    pending: AtomicU64,
    enqueued: AtomicU64,
    wake: Notify,
    closed: AtomicBool,
}

/// Producer half, owned by the worker.
pub struct NotificationSender {
    producer: HeapProducer<Notification>,
    signal: Arc<Signal>,
    next_sequence: u64,
}

/// Consumer half, owned by the controller.
pub struct NotificationReceiver {
    consumer: HeapConsumer<Notification>,
    signal: Arc<Signal>,
}

/// Handle used by teardown to close the channel and release anyone stalled on
/// it.
#[derive(Debug, Clone)]
pub struct ChannelRelease {
    signal: Arc<Signal>,
}

/// Create a channel holding at most `capacity` undrained records.
pub fn channel(
    capacity: usize,
) -> Result<(NotificationSender, NotificationReceiver), ChannelError> {
    if capacity == 0 {
        return Err(ChannelError::ZeroCapacity);
    }

    if capacity > Semaphore::MAX_PERMITS {
        return Err(ChannelError::Alloc { capacity });
    }
    let (producer, consumer) = HeapRb::<Notification>::try_new(capacity)
        .map_err(|_| ChannelError::Alloc { capacity })?
        .split();
    let signal = Arc::new(Signal {
        free_slots: Semaphore::new(capacity),
        pending: AtomicU64::new(0),
        enqueued: AtomicU64::new(0),
        wake: Notify::new(),
        closed: AtomicBool::new(false),
    });

    Ok((
        NotificationSender {
            producer,
            signal: Arc::clone(&signal),
            next_sequence: 1,
        },
        NotificationReceiver { consumer, signal },
    ))
}

impl NotificationSender {
    /// Enqueue a record, waiting for a free slot if the ring is full.
    ///
    /// Returns the sequence number assigned to the record. Cancel-safe: if the
    /// future is dropped while waiting for a slot, nothing was enqueued.
    pub async fn send(&mut self, kind: NotificationKind) -> Result<u64, ChannelError> {
        let permit = self
            .signal
            .free_slots
            .acquire()
            .await
            .map_err(|_| ChannelError::Closed)?;
        // The slot is handed back by the consumer when it pops the record.
        permit.forget();

        let sequence = self.next_sequence;
        self.producer
            .push(Notification { sequence, kind })
            .map_err(|_| ChannelError::Overflow)?;
        self.next_sequence += 1;

        self.signal.enqueued.fetch_add(1, Ordering::SeqCst);
        self.signal.pending.fetch_add(1, Ordering::SeqCst);
        self.signal.wake.notify_one();
        Ok(sequence)
    }

    /// Records enqueued but not yet drained.
    pub fn pending(&self) -> u64 {
        self.signal.pending.load(Ordering::SeqCst)
    }
}

impl NotificationReceiver {
    /// Pop the next record without waiting.
    pub fn try_recv(&mut self) -> Option<Notification> {
        let notification = self.consumer.pop()?;
        self.signal.pending.fetch_sub(1, Ordering::SeqCst);
        self.signal.free_slots.add_permits(1);
        Some(notification)
    }

    /// Records enqueued but not yet drained.
    pub fn pending(&self) -> u64 {
        self.signal.pending.load(Ordering::SeqCst)
    }

    /// Total records ever enqueued on this channel.
    pub fn enqueued(&self) -> u64 {
        self.signal.enqueued.load(Ordering::SeqCst)
    }

    /// Resolve once at least one record is pending or the channel is closed.
    pub async fn wait_pending(&self) {
        loop {
            let notified = self.signal.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending() > 0 || self.signal.closed.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// Handle for teardown.
    pub fn release_handle(&self) -> ChannelRelease {
        ChannelRelease {
            signal: Arc::clone(&self.signal),
        }
    }
}

impl ChannelRelease {
    /// Close the channel and wake every waiter on either side. Returns `false`
    /// if it was already closed.
    pub fn close(&self) -> bool {
        if self.signal.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.signal.free_slots.close();
        self.signal.wake.notify_waiters();
        true
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.signal.closed.load(Ordering::SeqCst)
    }
}
