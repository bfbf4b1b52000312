//! Memory-mapped, acknowledgement-gated data block.
//!
//! Moves one unit of measurement data at a time from the worker to the
//! controller. The payload region is a `memmap2` mapping: anonymous by
//! default, or backed by a file (typically under `/dev/shm`) when a path is
//! configured so the block can be inspected from outside the process.
//!
//! # Protocol
//!
//! ```text
//!   Empty ──claim──▶ Writing ──publish──▶ Filled ──consume──▶ Consumed
//!                       ▲                                        │
//!                       └────────────────claim───────────────────┘
//! ```
//!
//! - Only the single [`BlockWriter`] can claim; it takes `&mut self`, so two
//!   publishes cannot overlap.
//! - A claim is a compare-and-swap from `Empty` or `Consumed`. While the block
//!   is `Filled` the writer parks until the reader acknowledges.
//! - The reader flips `Filled → Consumed` after the payload has been handed
//!   to its callback, then wakes the writer.
//!
//! Memory use is one mapping of `capacity` bytes for the lifetime of a run.

use memmap2::{MmapMut, MmapOptions};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Errors raised by the shared data block.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Capacity must be at least one byte.
    #[error("Data block capacity must be non-zero")]
    ZeroCapacity,

    /// Payload does not fit the block.
    #[error("Payload of {len} bytes exceeds data block capacity of {capacity} bytes")]
    TooLarge {
        /// Offered payload length.
        len: usize,
        /// Block capacity.
        capacity: usize,
    },

    /// The mapping could not be created.
    #[error("Failed to map data block: {0}")]
    Map(#[from] std::io::Error),

    /// A read was attempted on a block that holds no unconsumed payload.
    #[error("Data block is {0:?}, expected Filled")]
    NotFilled(BlockState),

    /// The block was freed by teardown.
    #[error("Data block has been released")]
    Released,

    /// A thread panicked while holding the payload lock.
    #[error("Data block lock poisoned")]
    Poisoned,
}

/// Lifecycle state of the block.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Never written.
    Empty = 0,
    /// Claimed by the writer, payload being copied in.
    Writing = 1,
    /// Payload published, waiting for the reader.
    Filled = 2,
    /// Reader acknowledged; free for reuse.
    Consumed = 3,
}

impl BlockState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => BlockState::Writing,
            2 => BlockState::Filled,
            3 => BlockState::Consumed,
            _ => BlockState::Empty,
        }
    }
}

struct BlockShared {
    state: AtomicU8,
    len: AtomicUsize,
    origin: AtomicUsize,
    capacity: usize,
    region: Mutex<Option<MmapMut>>,
    acked: Notify,
    backing: Option<PathBuf>,
    released: AtomicBool,
}

/// Writing end, owned by the worker. Not cloneable.
pub struct BlockWriter {
    shared: Arc<BlockShared>,
}

/// Reading end, owned by the controller.
pub struct BlockReader {
    shared: Arc<BlockShared>,
}

/// Handle used by teardown to free the mapping.
#[derive(Clone)]
pub struct BlockRelease {
    shared: Arc<BlockShared>,
}

impl std::fmt::Debug for BlockRelease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRelease")
            .field("capacity", &self.shared.capacity)
            .field("backing", &self.shared.backing)
            .field("released", &self.shared.released.load(Ordering::SeqCst))
            .finish()
    }
}

/// Allocates data blocks and hands out their two ends.
pub struct DataBlockManager;

impl DataBlockManager {
    /// Allocate a block of `capacity` bytes.
    ///
    /// With `backing = None` the block is an anonymous mapping. With a path,
    /// the file is created (or truncated), sized and mapped; it is removed when
    /// the block is freed. On error nothing is left behind.
    pub fn allocate(
        capacity: usize,
        backing: Option<&Path>,
    ) -> Result<(BlockWriter, BlockReader), BlockError> {
        if capacity == 0 {
            return Err(BlockError::ZeroCapacity);
        }

        let map = match backing {
            None => MmapOptions::new().len(capacity).map_anon()?,
            Some(path) => map_file(path, capacity)?,
        };

        let shared = Arc::new(BlockShared {
            state: AtomicU8::new(BlockState::Empty as u8),
            len: AtomicUsize::new(0),
            origin: AtomicUsize::new(0),
            capacity,
            region: Mutex::new(Some(map)),
            acked: Notify::new(),
            backing: backing.map(Path::to_path_buf),
            released: AtomicBool::new(false),
        });
        debug!(capacity, backing = ?shared.backing, "Data block allocated");

        Ok((
            BlockWriter {
                shared: Arc::clone(&shared),
            },
            BlockReader { shared },
        ))
    }
}

fn map_file(path: &Path, capacity: usize) -> Result<MmapMut, BlockError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    let mapped = file
        .set_len(capacity as u64)
        .and_then(|()| map_sized(&file, capacity));

    mapped.map_err(|e| {
        let _ = fs::remove_file(path);
        BlockError::Map(e)
    })
}

#[allow(unsafe_code)]
fn map_sized(file: &File, capacity: usize) -> io::Result<MmapMut> {
    // SAFETY: the file was just created and sized by us and is not truncated
    // again while the mapping lives; the mapping is dropped before the file
    // is removed.
    unsafe { MmapOptions::new().len(capacity).map_mut(file) }
}

impl BlockWriter {
    /// Copy `payload` into the block and mark it `Filled`.
    ///
    /// Waits while a previous payload is still unacknowledged. `origin` is the
    /// token index that produced the data.
    pub async fn publish(&mut self, origin: usize, payload: &[u8]) -> Result<(), BlockError> {
        let capacity = self.shared.capacity;
        if payload.len() > capacity {
            return Err(BlockError::TooLarge {
                len: payload.len(),
                capacity,
            });
        }

        self.claim().await?;

        {
            let mut region = self
                .shared
                .region
                .lock()
                .map_err(|_| BlockError::Poisoned)?;
            let map = region.as_mut().ok_or(BlockError::Released)?;
            map[..payload.len()].copy_from_slice(payload);
        }

        self.shared.len.store(payload.len(), Ordering::Release);
        self.shared.origin.store(origin, Ordering::Release);
        self.shared
            .state
            .store(BlockState::Filled as u8, Ordering::Release);
        Ok(())
    }

    async fn claim(&mut self) -> Result<(), BlockError> {
        loop {
            let acked = self.shared.acked.notified();
            tokio::pin!(acked);
            acked.as_mut().enable();

            if self.shared.released.load(Ordering::SeqCst) {
                return Err(BlockError::Released);
            }
            if self.try_claim_from(BlockState::Empty) || self.try_claim_from(BlockState::Consumed) {
                return Ok(());
            }
            acked.await;
        }
    }

    fn try_claim_from(&self, from: BlockState) -> bool {
        self.shared
            .state
            .compare_exchange(
                from as u8,
                BlockState::Writing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BlockState {
        BlockState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Block capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl BlockReader {
    /// Hand the filled payload to `f`, then acknowledge it.
    ///
    /// `f` receives the origin token index and the payload bytes.
    pub fn consume<R>(&self, f: impl FnOnce(usize, &[u8]) -> R) -> Result<R, BlockError> {
        let state = self.state();
        if state != BlockState::Filled {
            return Err(BlockError::NotFilled(state));
        }

        let len = self.shared.len.load(Ordering::Acquire);
        let origin = self.shared.origin.load(Ordering::Acquire);
        let out = {
            let region = self
                .shared
                .region
                .lock()
                .map_err(|_| BlockError::Poisoned)?;
            let map = region.as_ref().ok_or(BlockError::Released)?;
            f(origin, &map[..len])
        };

        self.shared
            .state
            .store(BlockState::Consumed as u8, Ordering::Release);
        self.shared.acked.notify_one();
        Ok(out)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BlockState {
        BlockState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Handle for teardown.
    pub fn release_handle(&self) -> BlockRelease {
        BlockRelease {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl BlockRelease {
    /// Unmap the block, remove its backing file and wake a parked writer.
    /// Returns `false` if it was already freed.
    pub fn free(&self) -> bool {
        if self.shared.released.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.shared
            .region
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(path) = &self.shared.backing {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove data block file");
            }
        }

        self.shared.acked.notify_waiters();
        true
    }

    /// Whether [`free`](Self::free) has run.
    pub fn is_freed(&self) -> bool {
        self.shared.released.load(Ordering::SeqCst)
    }
}
