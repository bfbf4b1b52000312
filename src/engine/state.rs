//! Run and exit states shared by the worker, the controller and hosts.

use crate::error::RunError;
use std::fmt;
use thiserror::Error;

/// Why a worker stopped with a failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerFailure {
    /// Instrument I/O failed.
    #[error("{0}")]
    Transport(String),

    /// The shared data block rejected a payload.
    #[error("data block: {0}")]
    Block(String),

    /// The program asked for something the worker cannot do at run time.
    #[error("program: {0}")]
    Program(String),
}

/// Exit status the worker reports in its terminal notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// The program ran to its end.
    Completed,
    /// A stop request was honored.
    Cancelled,
    /// The worker gave up on a fatal error.
    Failed(WorkerFailure),
}

/// How the worker's execution unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// `WorkerDone` arrived before the worker disappeared.
    Graceful(ExitStatus),
    /// The worker disappeared without `WorkerDone`.
    Crashed,
}

/// Coarse classification of a finished run for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed normally.
    Graceful,
    /// Stopped on request.
    Stopped,
    /// Ended on a reported failure.
    Failed,
    /// Worker vanished.
    Crashed,
}

/// Run state as seen by the controller and its host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunState {
    /// No run has been started.
    #[default]
    NotStarted,
    /// Worker spawned; handshake not yet acknowledged.
    Starting,
    /// Worker is executing the program.
    Running,
    /// A stop was requested and the worker has not finished yet.
    Cancelling,
    /// The run is over and resources are released.
    Done(Termination),
}

impl Termination {
    /// Map to the presentation outcome.
    pub fn outcome(&self) -> Outcome {
        match self {
            Termination::Graceful(ExitStatus::Completed) => Outcome::Graceful,
            Termination::Graceful(ExitStatus::Cancelled) => Outcome::Stopped,
            Termination::Graceful(ExitStatus::Failed(_)) => Outcome::Failed,
            Termination::Crashed => Outcome::Crashed,
        }
    }

    /// Fold into the run error taxonomy.
    pub fn into_result(self) -> Result<(), RunError> {
        match self {
            Termination::Graceful(ExitStatus::Completed) => Ok(()),
            Termination::Graceful(ExitStatus::Cancelled) => Err(RunError::CancelledByUser),
            Termination::Graceful(ExitStatus::Failed(WorkerFailure::Transport(reason))) => {
                Err(RunError::TransportFailure(reason))
            }
            Termination::Graceful(ExitStatus::Failed(other)) => {
                Err(RunError::WorkerFault(other.to_string()))
            }
            Termination::Crashed => Err(RunError::CrashTermination),
        }
    }
}

impl RunState {
    /// Whether the run has finished.
    pub fn is_done(&self) -> bool {
        matches!(self, RunState::Done(_))
    }

    /// Whether a worker is alive or still being reaped.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunState::Starting | RunState::Running | RunState::Cancelling
        )
    }

    /// Presentation outcome once the run is done.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            RunState::Done(termination) => Some(termination.outcome()),
            _ => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Completed => write!(f, "completed"),
            ExitStatus::Cancelled => write!(f, "cancelled"),
            ExitStatus::Failed(failure) => write!(f, "failed ({})", failure),
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::NotStarted => write!(f, "NotStarted"),
            RunState::Starting => write!(f, "Starting"),
            RunState::Running => write!(f, "Running"),
            RunState::Cancelling => write!(f, "Cancelling"),
            RunState::Done(Termination::Graceful(status)) => write!(f, "Done ({})", status),
            RunState::Done(Termination::Crashed) => write!(f, "Done (crashed)"),
        }
    }
}
