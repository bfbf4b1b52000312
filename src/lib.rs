//! Core library for the daq_runner application.
//!
//! Runs scripted measurement programs against laboratory instruments while a
//! separate controller stays responsive, receives the measurement stream and
//! can stop the run at any time.
//!
//! ```no_run
//! use daq_runner::config::RunnerConfig;
//! use daq_runner::engine::RunController;
//! use daq_runner::program::{LoopKind, ProgramBuilder};
//! use daq_runner::sink::TracingSink;
//! use daq_runner::transport::MockTransport;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RunnerConfig::load()?;
//!     let program = ProgramBuilder::new()
//!         .begin_loop(LoopKind::Times(5))
//!         .query("PM:POWER?", 64)
//!         .end_loop()
//!         .build()?;
//!
//!     let mut controller = RunController::new(config.engine);
//!     controller.start(program, Box::new(MockTransport::new()))?;
//!     let state = controller.run_until_done(&mut TracingSink).await;
//!     println!("{state}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod program;
pub mod sink;
pub mod telemetry;
pub mod transport;

pub use error::{RunError, RunResult};
