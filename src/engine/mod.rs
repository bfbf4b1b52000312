//! Execution/communication engine.
//!
//! One run is two cooperating Tokio tasks:
//!
//! - the **worker** ([`worker`]) interprets a [`Program`](crate::program::Program),
//!   calls the instrument [`Transport`](crate::transport::Transport) and
//!   publishes data;
//! - the **controller** ([`RunController`]) drains notifications from the
//!   host's own schedule, forwards data to a [`DataSink`](crate::sink::DataSink)
//!   and can cancel the worker cooperatively.
//!
//! They share a bounded notification ring ([`notify`]), a single
//! acknowledgement-gated data block ([`block`]), a cancellable wait
//! ([`wait`]) and an exactly-once teardown with liveness ([`teardown`]).

pub mod block;
pub mod controller;
pub mod notify;
pub mod state;
pub mod teardown;
pub mod wait;
pub mod worker;

pub use block::{BlockError, BlockState, DataBlockManager};
pub use controller::{ErrorCounts, RunController};
pub use notify::{ChannelError, Notification, NotificationKind};
pub use state::{ExitStatus, Outcome, RunState, Termination, WorkerFailure};
pub use teardown::Side;
pub use wait::{CancelToken, WokeBy};
pub use worker::WorkerPhase;
