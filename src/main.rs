//! `daq_runner` command-line runner.
//!
//! ```text
//! daq_runner run scan.toml --mock-response "PM:POWER?=1.2e-3" --output scan.jsonl
//! daq_runner run scan.toml --serial /dev/ttyUSB0 --baud 9600
//! daq_runner check scan.toml
//! ```
//!
//! The first Ctrl-C asks the worker to stop at its next safe point (the
//! cleanup region still runs); a second Ctrl-C kills it.

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use daq_runner::config::{RunnerConfig, DEFAULT_CONFIG_FILE};
use daq_runner::engine::{RunController, RunState, Termination};
use daq_runner::program::file;
use daq_runner::sink::{DataSink, JsonLinesSink, TracingSink};
use daq_runner::telemetry;
use daq_runner::transport::{MockTransport, Transport};
use figment::providers::Serialized;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "daq_runner",
    version,
    about = "Run scripted measurement programs against laboratory instruments",
    arg_required_else_help = true
)]
struct Cli {
    /// Configuration file (default: daq_runner.toml in the working directory).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the configured log level.
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a program file.
    Run(RunArgs),

    /// Parse and link a program file without running it.
    Check(CheckArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Program file (.toml or .json).
    program: PathBuf,

    /// Scripted reply for the mock instrument, as COMMAND=REPLY. Repeat to
    /// queue several replies for the same command.
    #[arg(long = "mock-response", value_name = "CMD=REPLY")]
    mock_responses: Vec<String>,

    /// Simulated latency of the mock instrument per call.
    #[arg(long, value_name = "MS", default_value_t = 0)]
    mock_latency_ms: u64,

    /// Talk to a serial instrument on this port instead of the mock.
    #[arg(long, value_name = "PORT")]
    serial: Option<String>,

    /// Serial baud rate.
    #[arg(long, default_value_t = 9600)]
    baud: u32,

    /// Also write every data unit as a JSON line to this file.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Program file (.toml or .json).
    program: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref(), cli.log_level.as_deref())?;
    telemetry::init(&config.application).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Run(args) => run(args, config).await,
        Commands::Check(args) => check(&args),
    }
}

fn load_config(path: Option<&Path>, log_level: Option<&str>) -> Result<RunnerConfig> {
    let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
    let mut figment = RunnerConfig::figment(path);
    if let Some(level) = log_level {
        figment = figment.merge(Serialized::default("application.log_level", level));
    }

    let config: RunnerConfig = figment
        .extract()
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn run(args: RunArgs, config: RunnerConfig) -> Result<ExitCode> {
    let (program_file, program) = file::load(&args.program)
        .with_context(|| format!("loading program {}", args.program.display()))?;
    let name = program_file
        .name
        .unwrap_or_else(|| args.program.display().to_string());

    let transport = build_transport(&args, &config)?;

    let mut sinks: Vec<Box<dyn DataSink + Send>> = vec![Box::new(TracingSink)];
    if let Some(path) = &args.output {
        let sink = JsonLinesSink::create(path)
            .with_context(|| format!("creating output file {}", path.display()))?;
        sinks.push(Box::new(sink));
    }

    let mut controller = RunController::new(config.engine.clone());
    let run_id = controller.start(program, transport)?;
    info!(%run_id, program = %name, "Running program");

    let mut tick = tokio::time::interval(config.engine.poll_interval());
    let mut interrupts = 0_u32;
    loop {
        if let RunState::Done(termination) = controller.poll(&mut sinks) {
            return Ok(report(termination));
        }

        tokio::select! {
            _ = tick.tick() => {}
            () = controller.wait_for_activity() => {}
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for Ctrl-C")?;
                interrupts += 1;
                if interrupts == 1 {
                    warn!("Interrupt received; stopping at the next safe point (Ctrl-C again to kill)");
                    controller.request_stop();
                } else {
                    controller.kill();
                }
            }
        }
    }
}

fn report(termination: Termination) -> ExitCode {
    match termination.into_result() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if !e.is_failure() => {
            info!("{e}");
            ExitCode::from(130)
        }
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn build_transport(args: &RunArgs, config: &RunnerConfig) -> Result<Box<dyn Transport>> {
    if let Some(port) = &args.serial {
        return open_serial(port, args.baud, config);
    }

    let mock = MockTransport::new().with_latency(Duration::from_millis(args.mock_latency_ms));
    for spec in &args.mock_responses {
        let (command, reply) = spec
            .split_once('=')
            .ok_or_else(|| anyhow!("--mock-response expects COMMAND=REPLY, got {spec:?}"))?;
        mock.push_reply(command, reply);
    }
    Ok(Box::new(mock))
}

#[cfg(feature = "instrument_serial")]
fn open_serial(port: &str, baud: u32, config: &RunnerConfig) -> Result<Box<dyn Transport>> {
    use daq_runner::transport::SerialTransport;

    let timeout = Duration::from_millis(config.transport.serial_timeout_ms);
    let delimiter = config.transport.response_delimiter_byte()?;
    let transport = SerialTransport::open(port, baud, timeout)
        .with_context(|| format!("opening serial port '{port}' at {baud} baud"))?
        .with_line_terminator(config.transport.line_terminator.as_bytes())
        .with_response_delimiter(delimiter);
    Ok(Box::new(transport))
}

#[cfg(not(feature = "instrument_serial"))]
fn open_serial(_port: &str, _baud: u32, _config: &RunnerConfig) -> Result<Box<dyn Transport>> {
    anyhow::bail!("serial support is not compiled in; rebuild with --features instrument_serial")
}

fn check(args: &CheckArgs) -> Result<ExitCode> {
    let (program_file, program) = file::load(&args.program)
        .with_context(|| format!("checking program {}", args.program.display()))?;

    println!(
        "{}: {} tokens, main body ends at {}",
        program_file.name.as_deref().unwrap_or("program"),
        program.len(),
        program.body_end()
    );
    for (index, token) in program.tokens().iter().enumerate() {
        if program.cleanup() == Some(index) {
            println!("     -- cleanup --");
        }
        println!("{index:>4} {token}");
    }
    Ok(ExitCode::SUCCESS)
}
