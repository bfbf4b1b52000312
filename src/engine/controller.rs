//! The controller: spawns the worker, drains its notifications and decides
//! how the run ended.
//!
//! The host drives [`RunController::poll`] from whatever context it has (a UI
//! idle tick, a timer, or [`RunController::wait_for_activity`]). `poll` never
//! awaits: it pops notifications in order, hands data to the sink and
//! acknowledges the shared block.
//!
//! A run is `Done` either when `WorkerDone` has been drained (graceful), or
//! when the worker's exit guard has closed without one (crashed). In both cases
//! the controller then releases the shared resources.

use crate::config::EngineConfig;
use crate::engine::block::{BlockReader, DataBlockManager};
use crate::engine::notify::{self, NotificationKind, NotificationReceiver};
use crate::engine::state::{ExitStatus, RunState, Termination, WorkerFailure};
use crate::engine::teardown::{self, Liveness, LivenessGuard, Side, Teardown};
use crate::engine::wait::CancelToken;
use crate::engine::worker::{Worker, WorkerParts};
use crate::error::{RunError, RunResult};
use crate::program::Program;
use crate::sink::{DataSink, DataUnit};
use crate::transport::Transport;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Problems the controller noticed while draining.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounts {
    /// Notifications whose sequence number did not follow the previous one.
    pub sequence_gaps: u64,
    /// `DataReady` records whose block could not be read.
    pub block_faults: u64,
}

impl ErrorCounts {
    /// Whether anything was counted.
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

struct ActiveRun {
    id: Uuid,
    span: Span,
    handle: JoinHandle<ExitStatus>,
    notifications: NotificationReceiver,
    block: BlockReader,
    cancel: CancelToken,
    handshake: Option<oneshot::Sender<()>>,
    worker: Liveness,
    teardown: Teardown,
    consume_cursor: u64,
    exit_status: Option<ExitStatus>,
    // Dropping this tells the worker the controller is gone.
    _guard: LivenessGuard,
}

/// Owns one run at a time and exposes the control surface to the host.
pub struct RunController {
    config: EngineConfig,
    state: RunState,
    reported: Option<RunState>,
    run: Option<ActiveRun>,
    last_run_id: Option<Uuid>,
    errors: ErrorCounts,
}

impl RunController {
    /// Controller with the given engine settings. Nothing is allocated until
    /// [`start`](Self::start).
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: RunState::NotStarted,
            reported: None,
            run: None,
            last_run_id: None,
            errors: ErrorCounts::default(),
        }
    }

    /// Spawn a worker for `program` on the current Tokio runtime.
    ///
    /// Fails with [`RunError::SpawnFailure`] if there is no runtime or the
    /// channel or data block cannot be allocated; nothing is left allocated
    /// and the run state is unchanged in that case.
    pub fn start(&mut self, program: Program, transport: Box<dyn Transport>) -> RunResult<Uuid> {
        if self.run.is_some() {
            return Err(RunError::AlreadyRunning);
        }
        self.config.validate()?;

        let runtime = Handle::try_current()
            .map_err(|e| RunError::SpawnFailure(format!("no Tokio runtime: {e}")))?;
        let (sender, notifications) = notify::channel(self.config.notification_capacity)
            .map_err(|e| RunError::SpawnFailure(e.to_string()))?;
        let (writer, block) = DataBlockManager::allocate(
            self.config.block_capacity_bytes,
            self.config.block_backing_path.as_deref(),
        )
        .map_err(|e| RunError::SpawnFailure(e.to_string()))?;

        let teardown = Teardown::new(notifications.release_handle(), block.release_handle());
        let (controller_guard, controller_alive) = teardown::liveness();
        let (exit_guard, worker_alive) = teardown::liveness();
        let (ack_tx, ack_rx) = oneshot::channel();
        let cancel = CancelToken::new();

        let id = Uuid::new_v4();
        let span = info_span!("run", run_id = %id);
        let tokens = program.len();
        let transport_name = transport.name().to_string();

        let worker = Worker::new(WorkerParts {
            program,
            transport,
            notifications: sender,
            block: writer,
            cancel: cancel.clone(),
            controller: controller_alive,
            exit_guard,
            teardown: teardown.clone(),
            stall_warn_after: self.config.stall_warn_after(),
        });
        let handle = runtime.spawn(worker.run(ack_rx).instrument(span.clone()));

        span.in_scope(|| info!(tokens, transport = %transport_name, "Run started"));

        self.run = Some(ActiveRun {
            id,
            span,
            handle,
            notifications,
            block,
            cancel,
            handshake: Some(ack_tx),
            worker: worker_alive,
            teardown,
            consume_cursor: 0,
            exit_status: None,
            _guard: controller_guard,
        });
        self.state = RunState::Starting;
        self.reported = None;
        self.last_run_id = Some(id);
        self.errors = ErrorCounts::default();
        Ok(id)
    }

    /// Drain the notifications pending at the time of the call, forward data
    /// to `sink`, and detect the end of the run. Never blocks, and handles at
    /// most `notification_capacity` records per call.
    pub fn poll(&mut self, sink: &mut dyn DataSink) -> RunState {
        if let Some(run) = self.run.as_mut() {
            let span = run.span.clone();
            let _entered = span.enter();

            // Sampled before draining: WorkerDone is always enqueued before
            // the guard drops, so once the worker is gone the drain budget
            // read after this sample covers it.
            let worker_gone = !run.worker.is_peer_alive();
            run.drain(&mut self.state, &mut self.errors, sink);

            let termination = match run.exit_status.take() {
                Some(status) => Some(Termination::Graceful(status)),
                None if worker_gone => Some(Termination::Crashed),
                None => None,
            };
            if let Some(termination) = termination {
                self.finish(termination);
            }
        }

        if self.reported.as_ref() != Some(&self.state) {
            sink.on_state(&self.state);
            self.reported = Some(self.state.clone());
        }
        self.state.clone()
    }

    fn finish(&mut self, termination: Termination) {
        let Some(mut run) = self.run.take() else {
            return;
        };
        let _entered = run.span.enter();

        match &termination {
            Termination::Graceful(ExitStatus::Completed) => info!("Run completed"),
            Termination::Graceful(ExitStatus::Cancelled) => info!("Run stopped"),
            Termination::Graceful(ExitStatus::Failed(WorkerFailure::Transport(reason))) => {
                error!(%reason, "Run ended on transport failure");
            }
            Termination::Graceful(ExitStatus::Failed(failure)) => {
                error!(%failure, "Run ended on worker fault");
            }
            Termination::Crashed => match (&mut run.handle).now_or_never() {
                Some(Err(e)) if e.is_panic() => error!("Worker panicked before reporting completion"),
                Some(Err(_)) => error!("Worker was aborted before reporting completion"),
                _ => error!("Worker disappeared before reporting completion"),
            },
        }

        run.teardown.release(Side::Controller);
        self.state = RunState::Done(termination);
    }

    /// Ask the worker to stop at its next safe point. Only the first request
    /// has an effect; returns whether this call was it.
    pub fn request_stop(&mut self) -> bool {
        let Some(run) = self.run.as_ref() else {
            return false;
        };
        let first = run.cancel.cancel();
        if first {
            run.span.in_scope(|| info!("Stop requested"));
            if matches!(self.state, RunState::Starting | RunState::Running) {
                self.state = RunState::Cancelling;
            }
        }
        first
    }

    /// Abort the worker task without waiting for a safe point. The next
    /// [`poll`](Self::poll) classifies the run.
    pub fn kill(&mut self) -> bool {
        let Some(run) = self.run.as_ref() else {
            return false;
        };
        run.span.in_scope(|| warn!("Killing worker"));
        run.handle.abort();
        true
    }

    /// Whether a run is in progress (started and not yet classified).
    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Current run state.
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Id of the current or most recent run.
    pub fn run_id(&self) -> Option<Uuid> {
        self.run.as_ref().map(|run| run.id).or(self.last_run_id)
    }

    /// Drain anomalies for the current or most recent run.
    pub fn error_counts(&self) -> ErrorCounts {
        self.errors
    }

    /// Resolve when there is something for [`poll`](Self::poll) to do: a
    /// pending notification, or the worker having gone. Returns immediately
    /// when no run is active.
    pub async fn wait_for_activity(&self) {
        let Some(run) = self.run.as_ref() else {
            return;
        };
        tokio::select! {
            () = run.notifications.wait_pending() => {}
            () = run.worker.peer_gone() => {}
        }
    }

    /// Poll until the run is done, sleeping on activity in between.
    pub async fn run_until_done(&mut self, sink: &mut dyn DataSink) -> RunState {
        let tick = self.config.poll_interval();
        loop {
            let state = self.poll(sink);
            if !self.is_running() {
                return state;
            }
            tokio::select! {
                () = self.wait_for_activity() => {}
                () = tokio::time::sleep(tick) => {}
            }
        }
    }
}

impl ActiveRun {
    /// Pop at most the records that were pending on entry. Records the worker
    /// enqueues while this runs are left for the next call, so one drain is
    /// bounded by the ring capacity even against a fast producer.
    fn drain(&mut self, state: &mut RunState, errors: &mut ErrorCounts, sink: &mut dyn DataSink) {
        let budget = self.notifications.pending();
        for _ in 0..budget {
            let Some(notification) = self.notifications.try_recv() else {
                break;
            };
            let sequence = notification.sequence;
            if sequence != self.consume_cursor + 1 {
                errors.sequence_gaps += 1;
                warn!(
                    expected = self.consume_cursor + 1,
                    got = sequence,
                    "Notification sequence gap"
                );
            }
            self.consume_cursor = sequence;

            match notification.kind {
                NotificationKind::Started => {
                    if let Some(ack) = self.handshake.take() {
                        // The worker may already be gone; classification
                        // happens below through its exit guard.
                        let _ = ack.send(());
                    }
                    if *state == RunState::Starting {
                        *state = RunState::Running;
                    }
                }
                NotificationKind::DataReady => {
                    let consumed = self.block.consume(|origin, payload| {
                        sink.on_data(&DataUnit {
                            sequence,
                            origin,
                            payload,
                        });
                    });
                    if let Err(e) = consumed {
                        errors.block_faults += 1;
                        warn!(sequence, error = %e, "Data block unreadable");
                    }
                }
                NotificationKind::CancelAck => {
                    if state.is_active() {
                        *state = RunState::Cancelling;
                    }
                }
                NotificationKind::WorkerDone(status) => {
                    self.exit_status = Some(status);
                }
            }
        }
    }
}

impl Drop for RunController {
    fn drop(&mut self) {
        if let Some(run) = self.run.take() {
            let _entered = run.span.enter();
            warn!("Controller dropped during a run; the worker will clean up and release");
            run.cancel.cancel();
            if !run.worker.is_peer_alive() {
                run.teardown.release(Side::Controller);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{LoopKind, ProgramBuilder};
    use crate::sink::CollectingSink;
    use crate::transport::MockTransport;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn config() -> EngineConfig {
        EngineConfig {
            notification_capacity: 4,
            block_capacity_bytes: 256,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_start_without_runtime_is_spawn_failure() {
        let mut controller = RunController::new(config());
        let program = ProgramBuilder::new().write("X").build().unwrap();
        let err = controller
            .start(program, Box::new(MockTransport::new()))
            .unwrap_err();
        assert!(matches!(err, RunError::SpawnFailure(_)));
        assert_eq!(controller.state(), &RunState::NotStarted);
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_spawn() {
        let mut controller = RunController::new(EngineConfig {
            notification_capacity: 0,
            ..EngineConfig::default()
        });
        let program = ProgramBuilder::new().build().unwrap();
        let err = controller
            .start(program, Box::new(MockTransport::new()))
            .unwrap_err();
        assert!(matches!(err, RunError::Config(_)));
    }

    #[tokio::test]
    async fn test_unallocatable_channel_is_spawn_failure() {
        let mut controller = RunController::new(EngineConfig {
            notification_capacity: usize::MAX / 64,
            ..config()
        });
        let program = ProgramBuilder::new().write("X").build().unwrap();
        let err = controller
            .start(program, Box::new(MockTransport::new()))
            .unwrap_err();
        assert!(matches!(err, RunError::SpawnFailure(msg) if msg.contains("notification ring")));
        assert_eq!(controller.state(), &RunState::NotStarted);
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn test_graceful_run_delivers_data_in_order() {
        let mock = MockTransport::new()
            .with_reply("READ?", "1")
            .with_reply("READ?", "2")
            .with_reply("READ?", "3");
        let program = ProgramBuilder::new()
            .begin_loop(LoopKind::Times(3))
            .query("READ?", 8)
            .end_loop()
            .build()
            .unwrap();

        let mut controller = RunController::new(config());
        controller.start(program, Box::new(mock)).unwrap();
        assert!(matches!(
            controller.start(ProgramBuilder::new().build().unwrap(), Box::new(MockTransport::new())),
            Err(RunError::AlreadyRunning)
        ));

        let mut sink = CollectingSink::new();
        let state = tokio::time::timeout(Duration::from_secs(5), controller.run_until_done(&mut sink))
            .await
            .unwrap();

        assert_eq!(state, RunState::Done(Termination::Graceful(ExitStatus::Completed)));
        assert_eq!(sink.texts(), vec!["1", "2", "3"]);
        assert!(sink.records.iter().all(|r| r.origin == 1));
        assert_eq!(sink.states.last(), Some(&state));
        assert!(controller.error_counts().is_clean());
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn test_repeated_stop_requests_are_idempotent() {
        let program = ProgramBuilder::new()
            .begin_loop(LoopKind::Forever)
            .sleep(Duration::from_millis(5))
            .end_loop()
            .build()
            .unwrap();

        let mut controller = RunController::new(config());
        assert!(!controller.request_stop());
        controller.start(program, Box::new(MockTransport::new())).unwrap();

        assert!(controller.request_stop());
        assert!(!controller.request_stop());
        assert_eq!(controller.state(), &RunState::Cancelling);

        let mut sink = CollectingSink::new();
        let state = tokio::time::timeout(Duration::from_secs(5), controller.run_until_done(&mut sink))
            .await
            .unwrap();
        assert_eq!(state, RunState::Done(Termination::Graceful(ExitStatus::Cancelled)));
        assert_eq!(state.outcome(), Some(crate::engine::Outcome::Stopped));
    }

    /// Slows the controller down so the worker can refill the ring mid-drain.
    struct SlowSink {
        inner: CollectingSink,
        per_unit: Duration,
    }

    impl DataSink for SlowSink {
        fn on_data(&mut self, unit: &DataUnit<'_>) {
            std::thread::sleep(self.per_unit);
            self.inner.on_data(unit);
        }

        fn on_state(&mut self, state: &RunState) {
            self.inner.on_state(state);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_poll_is_bounded_by_pending_records() {
        let program = ProgramBuilder::new()
            .begin_loop(LoopKind::Forever)
            .emit("x")
            .end_loop()
            .build()
            .unwrap();

        let mut controller = RunController::new(config());
        controller.start(program, Box::new(MockTransport::new())).unwrap();
        let mut sink = SlowSink {
            inner: CollectingSink::new(),
            per_unit: Duration::from_micros(200),
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while controller.poll(&mut sink) != RunState::Running {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            let before = sink.inner.records.len();
            controller.poll(&mut sink);
            let consumed = sink.inner.records.len() - before;
            assert!(
                consumed <= config().notification_capacity,
                "one poll consumed {consumed} units"
            );
        }

        controller.request_stop();
        let state = tokio::time::timeout(Duration::from_secs(5), controller.run_until_done(&mut sink))
            .await
            .unwrap();
        assert_eq!(state.outcome(), Some(crate::engine::Outcome::Stopped));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_stop_and_crash_are_logged() {
        let program = ProgramBuilder::new()
            .begin_loop(LoopKind::Forever)
            .sleep(Duration::from_millis(5))
            .end_loop()
            .build()
            .unwrap();

        let mut controller = RunController::new(config());
        controller.start(program, Box::new(MockTransport::new())).unwrap();
        controller.request_stop();
        let mut sink = CollectingSink::new();
        tokio::time::timeout(Duration::from_secs(5), controller.run_until_done(&mut sink))
            .await
            .unwrap();

        assert!(logs_contain("Stop requested"));
        assert!(logs_contain("Run stopped"));

        let program = ProgramBuilder::new()
            .sleep(Duration::from_secs(60))
            .build()
            .unwrap();
        controller.start(program, Box::new(MockTransport::new())).unwrap();
        assert!(controller.kill());
        let state = tokio::time::timeout(Duration::from_secs(5), controller.run_until_done(&mut sink))
            .await
            .unwrap();

        assert_eq!(state, RunState::Done(Termination::Crashed));
        assert!(logs_contain("Worker was aborted before reporting completion"));
    }
}
