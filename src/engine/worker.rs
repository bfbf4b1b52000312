//! The worker task: interprets a program, talks to the instrument and emits
//! data.
//!
//! ```text
//!   Starting ──ack──▶ Running ──stop seen at safe point──▶ CancelPending
//!                        │                                      │
//!                        ├── end of body / fatal error ──┐      │
//!                        ▼                               ▼      ▼
//!                                       Cleanup ──WorkerDone──▶ Exited
//! ```
//!
//! Cancellation is only observed between token steps. An instrument call in
//! flight always completes; a `Sleep` is cut short through the
//! [`CancelToken`].
//!
//! If the controller disappears the worker detaches: notifications and data
//! are dropped, the main body is cancelled, the cleanup region still runs (so
//! instruments are left safe), and the worker performs the final release of
//! the shared resources itself.

use crate::engine::block::{BlockError, BlockWriter};
use crate::engine::notify::{NotificationKind, NotificationSender};
use crate::engine::state::{ExitStatus, WorkerFailure};
use crate::engine::teardown::{Liveness, LivenessGuard, Side, Teardown};
use crate::engine::wait::{CancelToken, WokeBy};
use crate::program::{trim_end, LoopKind, Program, Statement, Token};
use crate::transport::Transport;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Worker lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    /// Waiting for the handshake acknowledgement.
    Starting,
    /// Executing the main body.
    Running,
    /// A stop request was observed at a safe point.
    CancelPending,
    /// Executing the cleanup region.
    Cleanup,
    /// Terminal notification sent.
    Exited,
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerPhase::Starting => write!(f, "Starting"),
            WorkerPhase::Running => write!(f, "Running"),
            WorkerPhase::CancelPending => write!(f, "CancelPending"),
            WorkerPhase::Cleanup => write!(f, "Cleanup"),
            WorkerPhase::Exited => write!(f, "Exited"),
        }
    }
}

/// Run-time state of one loop, addressed by its `LoopBegin` index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LoopFrame {
    counter: u64,
    limit: Option<u64>,
}

/// Everything a worker needs, handed over by the controller at spawn.
pub(crate) struct WorkerParts {
    pub program: Program,
    pub transport: Box<dyn Transport>,
    pub notifications: NotificationSender,
    pub block: BlockWriter,
    pub cancel: CancelToken,
    pub controller: Liveness,
    pub exit_guard: LivenessGuard,
    pub teardown: Teardown,
    pub stall_warn_after: Option<Duration>,
}

pub(crate) struct Worker {
    program: Arc<Program>,
    transport: Box<dyn Transport>,
    notifications: NotificationSender,
    block: BlockWriter,
    cancel: CancelToken,
    controller: Liveness,
    teardown: Teardown,
    stall_warn_after: Option<Duration>,
    phase: WorkerPhase,
    frames: Vec<Option<LoopFrame>>,
    last_response: Option<Vec<u8>>,
    cleanup_done: bool,
    detached: bool,
    // Dropped with the worker, which is how the controller sees it go.
    _exit_guard: LivenessGuard,
}

impl Worker {
    pub(crate) fn new(parts: WorkerParts) -> Self {
        let frames = vec![None; parts.program.len()];
        Self {
            program: Arc::new(parts.program),
            transport: parts.transport,
            notifications: parts.notifications,
            block: parts.block,
            cancel: parts.cancel,
            controller: parts.controller,
            teardown: parts.teardown,
            stall_warn_after: parts.stall_warn_after,
            phase: WorkerPhase::Starting,
            frames,
            last_response: None,
            cleanup_done: false,
            detached: false,
            _exit_guard: parts.exit_guard,
        }
    }

    /// Drive the program to completion and report the exit status.
    pub(crate) async fn run(mut self, handshake: oneshot::Receiver<()>) -> ExitStatus {
        self.notify(NotificationKind::Started).await;
        if !self.detached {
            tokio::select! {
                ack = handshake => {
                    if ack.is_err() {
                        self.detach("handshake abandoned");
                    }
                }
                () = self.controller.peer_gone() => self.detach("controller gone during handshake"),
            }
        }

        self.set_phase(WorkerPhase::Running);
        let status = self.run_body().await;
        let status = self.run_cleanup(status).await;

        self.notify(NotificationKind::WorkerDone(status.clone())).await;
        self.set_phase(WorkerPhase::Exited);
        match &status {
            ExitStatus::Failed(failure) => error!(%failure, "Worker finished with failure"),
            other => info!(status = %other, "Worker finished"),
        }

        if self.detached || !self.controller.is_peer_alive() {
            self.teardown.release(Side::Worker);
        }
        status
    }

    async fn run_body(&mut self) -> ExitStatus {
        let body_end = self.program.body_end();
        let mut cursor = 0;

        loop {
            // Safe point: the previous step, if any, has fully completed.
            if !self.detached && !self.controller.is_peer_alive() {
                self.detach("controller gone");
            }
            if self.cancel.is_cancelled() {
                self.set_phase(WorkerPhase::CancelPending);
                info!(cursor, "Stop request observed");
                self.notify(NotificationKind::CancelAck).await;
                return ExitStatus::Cancelled;
            }
            if cursor >= body_end {
                return ExitStatus::Completed;
            }

            cursor = match self.step(cursor).await {
                Ok(next) => next,
                Err(failure) => {
                    warn!(cursor, %failure, "Main body aborted");
                    return ExitStatus::Failed(failure);
                }
            };
        }
    }

    /// Run the cleanup region once. Stop requests are ignored from here on.
    async fn run_cleanup(&mut self, status: ExitStatus) -> ExitStatus {
        if self.cleanup_done {
            return status;
        }
        self.cleanup_done = true;
        self.set_phase(WorkerPhase::Cleanup);
        self.cancel.shield();

        let Some(start) = self.program.cleanup() else {
            return status;
        };

        let end = self.program.len();
        let mut cursor = start;
        while cursor < end {
            cursor = match self.step(cursor).await {
                Ok(next) => next,
                Err(failure) => {
                    warn!(cursor, %failure, "Cleanup aborted");
                    return match status {
                        ExitStatus::Failed(first) => ExitStatus::Failed(first),
                        _ => ExitStatus::Failed(failure),
                    };
                }
            };
        }
        status
    }

    /// Execute the token at `cursor` and return the next cursor.
    async fn step(&mut self, cursor: usize) -> Result<usize, WorkerFailure> {
        let program = Arc::clone(&self.program);
        let Some(token) = program.token(cursor) else {
            return Ok(program.len());
        };

        match token {
            Token::Statement(statement) => {
                self.execute(cursor, statement).await?;
                Ok(cursor + 1)
            }
            Token::LoopBegin { kind, end } => {
                let frame = match self.frames[cursor] {
                    Some(frame) => frame,
                    None => LoopFrame {
                        counter: 0,
                        limit: self.loop_limit(cursor, kind)?,
                    },
                };

                let go = match (kind, frame.limit) {
                    (LoopKind::While(condition), _) => {
                        condition.evaluate(self.last_response.as_deref())
                    }
                    (LoopKind::Forever, _) => true,
                    (_, Some(limit)) => frame.counter < limit,
                    (_, None) => false,
                };

                if go {
                    self.frames[cursor] = Some(LoopFrame {
                        counter: frame.counter + 1,
                        ..frame
                    });
                    Ok(cursor + 1)
                } else {
                    self.frames[cursor] = None;
                    Ok(end + 1)
                }
            }
            Token::LoopEnd { begin } => {
                // Back-edge; let the controller run even on a busy loop.
                tokio::task::yield_now().await;
                Ok(*begin)
            }
            Token::Break { target } => {
                if let Some(Token::LoopEnd { begin }) = program.token(*target) {
                    self.frames[*begin] = None;
                }
                Ok(target + 1)
            }
            Token::Continue { target } => Ok(*target),
            Token::If {
                condition,
                else_at,
                end,
            } => {
                if condition.evaluate(self.last_response.as_deref()) {
                    Ok(cursor + 1)
                } else {
                    Ok(else_at.map_or(*end, |at| at + 1))
                }
            }
            Token::Else { end } => Ok(*end),
        }
    }

    fn loop_limit(&self, cursor: usize, kind: &LoopKind) -> Result<Option<u64>, WorkerFailure> {
        match kind {
            LoopKind::Times(n) => Ok(Some(*n)),
            LoopKind::FromResponse => parse_count(self.last_response.as_deref())
                .map(Some)
                .ok_or_else(|| {
                    WorkerFailure::Program(format!(
                        "loop at token {cursor} expected an iteration count, last response was {:?}",
                        self.last_response
                            .as_deref()
                            .map(String::from_utf8_lossy)
                            .unwrap_or_default()
                    ))
                }),
            LoopKind::While(_) | LoopKind::Forever => Ok(None),
        }
    }

    async fn execute(&mut self, cursor: usize, statement: &Statement) -> Result<(), WorkerFailure> {
        match statement {
            Statement::Write { command } => {
                self.transport
                    .send(command)
                    .await
                    .map_err(|e| WorkerFailure::Transport(e.to_string()))?;
            }
            Statement::Query { command, max_len } => {
                self.transport
                    .send(command)
                    .await
                    .map_err(|e| WorkerFailure::Transport(e.to_string()))?;
                let reply = self
                    .transport
                    .receive(*max_len)
                    .await
                    .map_err(|e| WorkerFailure::Transport(e.to_string()))?;
                self.publish(cursor, &reply).await?;
                self.last_response = Some(reply);
            }
            Statement::Sleep(duration) => {
                if self.cancel.wait(*duration).await == WokeBy::Cancelled {
                    debug!(cursor, "Sleep cut short");
                }
            }
            Statement::Emit { payload } => self.publish(cursor, payload).await?,
            Statement::Log { message } => info!(cursor, "{}", message),
        }
        Ok(())
    }

    /// Place a payload in the shared block and announce it.
    async fn publish(&mut self, origin: usize, payload: &[u8]) -> Result<(), WorkerFailure> {
        if self.detached {
            return Ok(());
        }

        let published = tokio::select! {
            result = self.block.publish(origin, payload) => Some(result),
            () = self.controller.peer_gone() => None,
            never = stall_warning(self.stall_warn_after, "data block acknowledgement") => match never {},
        };

        match published {
            None | Some(Err(BlockError::Released)) => {
                self.detach("controller gone while publishing");
                Ok(())
            }
            Some(Err(e)) => Err(WorkerFailure::Block(e.to_string())),
            Some(Ok(())) => {
                self.notify(NotificationKind::DataReady).await;
                Ok(())
            }
        }
    }

    /// Enqueue a notification. Never fails: a closed channel or a vanished
    /// controller detaches the worker instead.
    async fn notify(&mut self, kind: NotificationKind) {
        if self.detached {
            return;
        }

        let sent = tokio::select! {
            result = self.notifications.send(kind) => result.ok(),
            () = self.controller.peer_gone() => None,
            never = stall_warning(self.stall_warn_after, "notification slot") => match never {},
        };
        if sent.is_none() {
            self.detach("controller gone while notifying");
        }
    }

    fn detach(&mut self, reason: &str) {
        if self.detached {
            return;
        }
        self.detached = true;
        warn!(reason, phase = %self.phase, "Controller unreachable; finishing without it");
        self.cancel.cancel();
    }

    fn set_phase(&mut self, phase: WorkerPhase) {
        if self.phase != phase {
            debug!(from = %self.phase, to = %phase, "Worker phase");
            self.phase = phase;
        }
    }
}

/// Resolves never; logs once if the surrounding wait lasts longer than
/// `after`.
async fn stall_warning(after: Option<Duration>, waiting_for: &str) -> Infallible {
    if let Some(after) = after {
        tokio::time::sleep(after).await;
        warn!(waiting_for, ?after, "Worker stalled on controller");
    }
    std::future::pending().await
}

fn parse_count(response: Option<&[u8]>) -> Option<u64> {
    let text = std::str::from_utf8(trim_end(response?)).ok()?;
    text.trim().parse().ok()
}
