//! End-to-end behavior of a run: data delivery, control flow, cancellation,
//! cleanup and crash detection.

use daq_runner::config::EngineConfig;
use daq_runner::engine::{ExitStatus, Outcome, RunController, RunState, Termination, WorkerFailure};
use daq_runner::program::{Condition, LoopKind, Program, ProgramBuilder};
use daq_runner::sink::CollectingSink;
use daq_runner::transport::MockTransport;
use daq_runner::RunError;
use std::time::Duration;

fn engine_config() -> EngineConfig {
    EngineConfig {
        notification_capacity: 4,
        block_capacity_bytes: 1024,
        ..EngineConfig::default()
    }
}

async fn run_to_end(program: Program, mock: &MockTransport) -> (RunState, CollectingSink) {
    let mut controller = RunController::new(engine_config());
    controller
        .start(program, Box::new(mock.clone()))
        .expect("start failed");
    let mut sink = CollectingSink::new();
    let state = tokio::time::timeout(Duration::from_secs(10), controller.run_until_done(&mut sink))
        .await
        .expect("run did not finish");
    (state, sink)
}

async fn poll_until_running(controller: &mut RunController, sink: &mut CollectingSink) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while controller.poll(sink) != RunState::Running {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("worker never acknowledged the handshake");
}

fn count(mock: &MockTransport, command: &str) -> usize {
    mock.sent_commands().iter().filter(|c| *c == command).count()
}

#[tokio::test]
async fn test_no_lost_data_with_slow_consumer() {
    const TOTAL: u64 = 200;
    let mock = MockTransport::new();
    for i in 0..TOTAL {
        mock.push_reply("N?", i.to_string());
    }
    let program = ProgramBuilder::new()
        .begin_loop(LoopKind::Times(TOTAL))
        .query("N?", 16)
        .end_loop()
        .build()
        .unwrap();

    let mut controller = RunController::new(engine_config());
    controller.start(program, Box::new(mock.clone())).unwrap();

    let mut sink = CollectingSink::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while controller.is_running() {
            controller.poll(&mut sink);
            // Let the worker run ahead and fill the ring.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    let expected: Vec<String> = (0..TOTAL).map(|i| i.to_string()).collect();
    assert_eq!(sink.texts(), expected);
    // Sequence 1 is the handshake; data follows contiguously.
    let sequences: Vec<u64> = sink.records.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, (2..TOTAL + 2).collect::<Vec<_>>());
    assert!(controller.error_counts().is_clean());
    assert_eq!(
        controller.state(),
        &RunState::Done(Termination::Graceful(ExitStatus::Completed))
    );
}

#[tokio::test]
async fn test_producer_stalls_until_block_is_acknowledged() {
    let mock = MockTransport::new();
    let program = ProgramBuilder::new()
        .begin_loop(LoopKind::Times(50))
        .query("N?", 16)
        .end_loop()
        .build()
        .unwrap();

    let mut controller = RunController::new(engine_config());
    controller.start(program, Box::new(mock.clone())).unwrap();
    let mut sink = CollectingSink::new();
    poll_until_running(&mut controller, &mut sink).await;

    // Nobody drains: one payload sits in the block, the next query waits for
    // the acknowledgement.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(mock.sent_commands().len() <= 2, "worker ran ahead of the consumer");

    let state = tokio::time::timeout(Duration::from_secs(10), controller.run_until_done(&mut sink))
        .await
        .unwrap();
    assert_eq!(state.outcome(), Some(Outcome::Graceful));
    assert_eq!(sink.records.len(), 50);
}

#[tokio::test]
async fn test_break_continue_and_if() {
    let mock = MockTransport::new();
    for v in ["0", "1", "2", "3", "4"] {
        mock.push_reply("V?", v);
    }
    let program = ProgramBuilder::new()
        .begin_loop(LoopKind::Times(5))
        .query("V?", 8)
        .begin_if(Condition::ResponseEquals(b"3".to_vec()))
        .break_loop()
        .end_if()
        .begin_if(Condition::ResponseEquals(b"1".to_vec()))
        .continue_loop()
        .end_if()
        .emit("after")
        .end_loop()
        .build()
        .unwrap();

    let (state, sink) = run_to_end(program, &mock).await;
    assert_eq!(state.outcome(), Some(Outcome::Graceful));
    assert_eq!(sink.texts(), vec!["0", "after", "1", "2", "after", "3"]);
    assert_eq!(count(&mock, "V?"), 4);
}

#[tokio::test]
async fn test_if_else_branches() {
    let mock = MockTransport::new()
        .with_reply("STATE?", "FAULT")
        .with_reply("STATE?", "OK");
    let program = ProgramBuilder::new()
        .begin_loop(LoopKind::Times(2))
        .query("STATE?", 16)
        .begin_if(Condition::ResponseContains(b"OK".to_vec()))
        .emit("good")
        .else_branch()
        .write("RESET")
        .end_if()
        .end_loop()
        .build()
        .unwrap();

    let (_, sink) = run_to_end(program, &mock).await;
    assert_eq!(sink.texts(), vec!["FAULT", "OK", "good"]);
    assert_eq!(count(&mock, "RESET"), 1);
}

#[tokio::test]
async fn test_counted_loop_rereads_count_after_exit() {
    let mock = MockTransport::new()
        .with_reply("COUNT?", "2")
        .with_reply("COUNT?", "3");
    let program = ProgramBuilder::new()
        .begin_loop(LoopKind::Times(2))
        .query("COUNT?", 8)
        .begin_loop(LoopKind::FromResponse)
        .write("INNER")
        .end_loop()
        .end_loop()
        .build()
        .unwrap();

    let (state, _) = run_to_end(program, &mock).await;
    assert_eq!(state.outcome(), Some(Outcome::Graceful));
    assert_eq!(count(&mock, "INNER"), 5);
}

#[tokio::test]
async fn test_unreadable_count_is_worker_fault() {
    let mock = MockTransport::new().with_reply("COUNT?", "many");
    let program = ProgramBuilder::new()
        .query("COUNT?", 8)
        .begin_loop(LoopKind::FromResponse)
        .write("INNER")
        .end_loop()
        .build()
        .unwrap();

    let (state, _) = run_to_end(program, &mock).await;
    let RunState::Done(termination) = state else {
        panic!("run not done");
    };
    assert!(matches!(
        termination,
        Termination::Graceful(ExitStatus::Failed(WorkerFailure::Program(_)))
    ));
    assert!(matches!(termination.into_result(), Err(RunError::WorkerFault(_))));
    assert_eq!(count(&mock, "INNER"), 0);
}

#[tokio::test]
async fn test_while_loop_polls_until_ready() {
    let mock = MockTransport::new()
        .with_reply("STATE?", "BUSY")
        .with_reply("STATE?", "BUSY")
        .with_reply("STATE?", "READY");
    let program = ProgramBuilder::new()
        .query("STATE?", 16)
        .begin_loop(LoopKind::While(Condition::ResponseEquals(b"BUSY".to_vec())))
        .sleep(Duration::from_millis(1))
        .query("STATE?", 16)
        .end_loop()
        .build()
        .unwrap();

    let (_, sink) = run_to_end(program, &mock).await;
    assert_eq!(sink.texts(), vec!["BUSY", "BUSY", "READY"]);
}

#[tokio::test]
async fn test_transport_failure_runs_cleanup_and_reports() {
    let mock = MockTransport::new();
    mock.fail_on("SHUTTER OPEN");
    let program = ProgramBuilder::new()
        .write("SHUTTER OPEN")
        .write("NEVER")
        .cleanup()
        .write("SHUTTER CLOSE")
        .build()
        .unwrap();

    let (state, _) = run_to_end(program, &mock).await;
    assert_eq!(state.outcome(), Some(Outcome::Failed));
    assert_eq!(mock.sent_commands(), vec!["SHUTTER OPEN", "SHUTTER CLOSE"]);

    let RunState::Done(termination) = state else {
        panic!("run not done");
    };
    assert!(matches!(
        termination.into_result(),
        Err(RunError::TransportFailure(reason)) if reason.contains("SHUTTER OPEN")
    ));
}

#[tokio::test]
async fn test_first_failure_wins_over_cleanup_failure() {
    let mock = MockTransport::new();
    mock.fail_on("MOVE");
    mock.fail_on("PARK");
    let program = ProgramBuilder::new()
        .write("MOVE")
        .cleanup()
        .write("PARK")
        .write("NOT REACHED")
        .build()
        .unwrap();

    let (state, _) = run_to_end(program, &mock).await;
    let RunState::Done(Termination::Graceful(ExitStatus::Failed(WorkerFailure::Transport(reason)))) =
        state
    else {
        panic!("expected a transport failure");
    };
    assert!(reason.contains("MOVE"));
    assert_eq!(count(&mock, "NOT REACHED"), 0);
}

#[tokio::test]
async fn test_cleanup_failure_after_completion_is_reported() {
    let mock = MockTransport::new();
    mock.fail_on("PARK");
    let program = ProgramBuilder::new()
        .write("MEASURE")
        .cleanup()
        .write("PARK")
        .build()
        .unwrap();

    let (state, _) = run_to_end(program, &mock).await;
    assert_eq!(state.outcome(), Some(Outcome::Failed));
}

#[tokio::test]
async fn test_cleanup_runs_once_under_repeated_stops() {
    let mock = MockTransport::new();
    let program = ProgramBuilder::new()
        .begin_loop(LoopKind::Forever)
        .write("STEP")
        .sleep(Duration::from_millis(5))
        .end_loop()
        .cleanup()
        .write("CLOSE")
        .build()
        .unwrap();

    let mut controller = RunController::new(engine_config());
    controller.start(program, Box::new(mock.clone())).unwrap();
    let mut sink = CollectingSink::new();
    poll_until_running(&mut controller, &mut sink).await;

    assert!(controller.request_stop());
    for _ in 0..20 {
        assert!(!controller.request_stop());
        controller.poll(&mut sink);
        tokio::task::yield_now().await;
    }

    let state = tokio::time::timeout(Duration::from_secs(5), controller.run_until_done(&mut sink))
        .await
        .unwrap();
    assert_eq!(state, RunState::Done(Termination::Graceful(ExitStatus::Cancelled)));
    assert_eq!(count(&mock, "CLOSE"), 1);
    assert!(sink.states.contains(&RunState::Cancelling));

    let RunState::Done(termination) = state else {
        unreachable!()
    };
    let err = termination.into_result().unwrap_err();
    assert!(matches!(err, RunError::CancelledByUser));
    assert!(!err.is_failure());
}

#[tokio::test]
async fn test_stop_cuts_long_sleep_short() {
    let mock = MockTransport::new();
    let program = ProgramBuilder::new()
        .sleep(Duration::from_secs(3600))
        .write("NEVER")
        .build()
        .unwrap();

    let mut controller = RunController::new(engine_config());
    controller.start(program, Box::new(mock.clone())).unwrap();
    let mut sink = CollectingSink::new();
    poll_until_running(&mut controller, &mut sink).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    controller.request_stop();
    let state = tokio::time::timeout(Duration::from_secs(2), controller.run_until_done(&mut sink))
        .await
        .expect("sleep was not interrupted");
    assert_eq!(state.outcome(), Some(Outcome::Stopped));
    assert_eq!(count(&mock, "NEVER"), 0);
}

#[tokio::test]
async fn test_panicking_worker_is_crashed() {
    let mock = MockTransport::new();
    mock.panic_on("BOOM");
    let program = ProgramBuilder::new()
        .write("BOOM")
        .cleanup()
        .write("CLOSE")
        .build()
        .unwrap();

    let (state, _) = run_to_end(program, &mock).await;
    assert_eq!(state, RunState::Done(Termination::Crashed));
    assert_eq!(count(&mock, "CLOSE"), 0);

    let RunState::Done(termination) = state else {
        unreachable!()
    };
    assert!(matches!(termination.into_result(), Err(RunError::CrashTermination)));
}

#[tokio::test]
async fn test_kill_before_done_is_crashed() {
    let dir = tempfile::tempdir().unwrap();
    let backing = dir.path().join("run.block");
    let program = ProgramBuilder::new()
        .begin_loop(LoopKind::Forever)
        .sleep(Duration::from_millis(10))
        .end_loop()
        .build()
        .unwrap();

    let mut controller = RunController::new(EngineConfig {
        block_backing_path: Some(backing.clone()),
        ..engine_config()
    });
    controller
        .start(program, Box::new(MockTransport::new()))
        .unwrap();
    assert!(backing.exists());

    let mut sink = CollectingSink::new();
    poll_until_running(&mut controller, &mut sink).await;
    assert!(controller.kill());

    let state = tokio::time::timeout(Duration::from_secs(5), controller.run_until_done(&mut sink))
        .await
        .unwrap();
    assert_eq!(state.outcome(), Some(Outcome::Crashed));
    assert!(!backing.exists(), "teardown must remove the backing file");
    assert!(!controller.kill());
}

#[tokio::test]
async fn test_oversized_payload_is_worker_fault() {
    let program = ProgramBuilder::new()
        .emit(vec![0u8; 4096])
        .build()
        .unwrap();

    let (state, _) = run_to_end(program, &MockTransport::new()).await;
    assert!(matches!(
        state,
        RunState::Done(Termination::Graceful(ExitStatus::Failed(WorkerFailure::Block(_))))
    ));
}

#[tokio::test]
async fn test_controller_can_run_again_after_done() {
    let mock = MockTransport::new();
    let mut controller = RunController::new(engine_config());
    let mut sink = CollectingSink::new();

    let first = controller
        .start(ProgramBuilder::new().emit("a").build().unwrap(), Box::new(mock.clone()))
        .unwrap();
    controller.run_until_done(&mut sink).await;
    let second = controller
        .start(ProgramBuilder::new().emit("b").build().unwrap(), Box::new(mock.clone()))
        .unwrap();
    let state = controller.run_until_done(&mut sink).await;

    assert_ne!(first, second);
    assert_eq!(controller.run_id(), Some(second));
    assert_eq!(state.outcome(), Some(Outcome::Graceful));
    assert_eq!(sink.texts(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_host_driven_by_wait_for_activity_only() {
    let mock = MockTransport::new();
    let program = ProgramBuilder::new()
        .begin_loop(LoopKind::Times(10))
        .emit("tick")
        .end_loop()
        .build()
        .unwrap();

    let mut controller = RunController::new(engine_config());
    controller.start(program, Box::new(mock)).unwrap();
    let mut sink = CollectingSink::new();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if controller.poll(&mut sink).is_done() {
                break;
            }
            controller.wait_for_activity().await;
        }
    })
    .await
    .expect("wait_for_activity missed a wakeup");

    assert_eq!(sink.records.len(), 10);
}
