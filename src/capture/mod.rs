//! Capture orchestration
//!
//! [`Capture`] owns everything a running capture needs: both pipes, the
//! logger process, the watchdog and the [`TransferLoop`]. A capture runs
//! through these states:
//!
//! ```text
//! Init -> Running -> StoppingGraceful | StoppingError -> Terminated
//! ```
//!
//! `Init` opens the capture output, starts the watchdog, creates the input
//! pipe, spawns the logger on it and waits for the logger to connect.
//! `Running` is the transfer loop. Every condition that ends a capture
//! arrives as one [`CaptureError`]; requested and downstream-driven stops end
//! silently, logger failures and unexpected errors are reported to the user
//! through stderr, the control pipe and a final log record in the capture.
//! `Terminated` always runs the full cleanup.

pub mod transfer;

use std::fs::File;
use std::process::Stdio;
use tracing::{debug, error, info, warn};

use crate::config::CaptureConfig;
use crate::control::ControlChannel;
use crate::exit::{self, ExitStatus};
use crate::pcap::PcapOptions;
use crate::pipe::{Pipe, PlatformPipe};
use crate::process::WatchedProcess;
use crate::signal::{SignalReason, Termination};
use crate::watchdog::{ProbeStatus, Watchdog};
use crate::{CaptureError, Result};

pub use transfer::{Direction, READ_CHUNK_SIZE, TransferLoop, classify};

/// Reported when the logger dies or its side of the input pipe breaks.
pub const LOGGER_EXITED_MESSAGE: &str = "JLinkRTTLogger exited unexpectedly.";
/// Reported when the logger cannot be spawned.
pub const SPAWN_FAILED_MESSAGE: &str =
    "Can not start JLinkRTTLogger. Check interface configuration.";
/// Reported for any other failure.
pub const UNEXPECTED_MESSAGE: &str = "Unexpected exception occurred.";

/// Lifecycle of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Init,
    Running,
    StoppingGraceful,
    StoppingError,
    Terminated,
}

/// One capture session from the logger to the analysis tool.
pub struct Capture<P: Pipe + Default = PlatformPipe> {
    config: CaptureConfig,
    state: CaptureState,
    exit: ExitStatus,
    input: P,
    output: P,
    transfer: TransferLoop,
    watchdog: Option<Watchdog>,
    process: Option<WatchedProcess>,
    logger_stdout: Option<File>,
    control: ControlChannel,
}

impl<P: Pipe + Default> std::fmt::Debug for Capture<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capture")
            .field("state", &self.state)
            .field("exit_code", &self.exit.code())
            .field("process", &self.process)
            .field("control", &self.control)
            .finish()
    }
}

impl Capture<PlatformPipe> {
    pub fn new(config: CaptureConfig) -> Self {
        Self::with_pipes(config, PlatformPipe::default(), PlatformPipe::default())
    }
}

impl<P: Pipe + Default> Capture<P> {
    /// Build a capture over the given, not yet opened, pipe endpoints.
    pub fn with_pipes(config: CaptureConfig, input: P, output: P) -> Self {
        let options = PcapOptions { note_to_log: config.note_to_log };
        Self {
            config,
            state: CaptureState::Init,
            exit: ExitStatus::new(),
            input,
            output,
            transfer: TransferLoop::new(options),
            watchdog: None,
            process: None,
            logger_stdout: None,
            control: ControlChannel::default(),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Run the capture with the OS termination signal bound to the calling
    /// thread. Returns the process exit code.
    pub fn run(self) -> i32 {
        match Termination::install(SignalReason::CaptureStop) {
            Ok(termination) => self.run_with(termination),
            Err(e) => {
                error!(error = %e, "Cannot install termination handler");
                let termination = Termination::manual(SignalReason::CaptureStop);
                self.finish(e, &termination)
            }
        }
    }

    /// Run the capture, stopping when `termination` is raised.
    pub fn run_with(mut self, termination: Termination) -> i32 {
        match self.execute(&termination) {
            Ok(()) => {
                self.cleanup(&termination);
                self.exit.code()
            }
            Err(e) => self.finish(e, &termination),
        }
    }

    fn execute(&mut self, termination: &Termination) -> Result<()> {
        self.set_state(CaptureState::Init);
        let fifo = self
            .config
            .fifo
            .clone()
            .ok_or_else(|| CaptureError::config_error("capture output FIFO not given"))?;

        self.control = ControlChannel::start(
            self.config.control_in.as_deref(),
            self.config.control_out.as_deref(),
            termination,
        )?;

        let fifo_name = fifo.to_string_lossy().into_owned();
        retry_interrupted(termination, || self.output.open(true, Some(fifo_name.as_str())))?;
        info!(fifo = %fifo.display(), "Output opened");

        let watchdog = {
            let termination = termination.clone();
            Watchdog::start(move |e| {
                error!(error = %e, "Watchdog probe failed");
                termination.raise(SignalReason::Unknown);
            })?
        };
        self.watchdog = Some(watchdog.clone());

        let pipe_name = self.input.create(false)?;
        debug!(pipe = %pipe_name, "Input created");

        self.start_logger(&pipe_name, &watchdog, termination)?;

        retry_interrupted(termination, || self.input.open(false, None))?;
        info!("Input opened");

        if let Some(probe) = self.output.write_probe() {
            let termination = termination.clone();
            watchdog.add(move || {
                if probe() {
                    return Ok(ProbeStatus::Continue);
                }
                info!("Output pipe closed, requesting capture stop");
                termination.raise(SignalReason::OutputPipe);
                Ok(ProbeStatus::Stop)
            });
        }

        self.set_state(CaptureState::Running);
        self.control.log("Capture started");
        self.transfer.run(&mut self.input, &mut self.output, termination)
    }

    fn start_logger(&mut self, pipe_name: &str, watchdog: &Watchdog, termination: &Termination) -> Result<()> {
        let mut command = match self.config.logger_command(pipe_name) {
            Ok(command) => command,
            Err(CaptureError::Config { reason }) => {
                self.report_error(&reason);
                return Err(CaptureError::terminated(SignalReason::CaptureStop));
            }
            Err(e) => return Err(e),
        };

        command.stdin(Stdio::null());
        match &self.config.logger_stdout {
            Some(path) => {
                let file = File::create(path).map_err(|e| {
                    CaptureError::pipe_error("create", path.display().to_string(), e)
                })?;
                command.stdout(Stdio::from(file.try_clone()?));
                command.stderr(Stdio::from(file.try_clone()?));
                self.logger_stdout = Some(file);
            }
            None => {
                command.stdout(Stdio::null());
                command.stderr(Stdio::null());
            }
        }

        let on_exit = {
            let termination = termination.clone();
            move |status: Option<std::process::ExitStatus>| {
                warn!(?status, "JLinkRTTLogger exited unexpectedly");
                termination.raise(SignalReason::RttProcessExit);
            }
        };
        match WatchedProcess::spawn(command, watchdog, on_exit) {
            Ok(process) => {
                info!(pid = process.pid(), "Logger process created");
                self.process = Some(process);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Cannot start logger");
                self.report_error(SPAWN_FAILED_MESSAGE);
                Err(CaptureError::terminated(SignalReason::CaptureStop))
            }
        }
    }

    /// Decide how the capture ended, report it and clean up.
    fn finish(mut self, err: CaptureError, termination: &Termination) -> i32 {
        self.stop_watchers(termination);
        match err.termination_reason() {
            Some(reason) if reason.is_graceful() => {
                self.set_state(CaptureState::StoppingGraceful);
                info!(%reason, bytes_in = self.transfer.bytes_in(), "Capture stopped, exiting gracefully");
            }
            Some(reason @ (SignalReason::RttProcessExit | SignalReason::InputPipe)) => {
                self.set_state(CaptureState::StoppingError);
                info!(%reason, "Logger side failed");
                self.report_error(LOGGER_EXITED_MESSAGE);
            }
            _ => {
                self.set_state(CaptureState::StoppingError);
                error!(error = %err, "Unexpected failure");
                self.report_error(UNEXPECTED_MESSAGE);
            }
        }
        self.exit.register(exit::exit_code(&err));
        self.cleanup(termination);
        self.exit.code()
    }

    /// Show `message` to the user and record it at the end of the capture.
    fn report_error(&mut self, message: &str) {
        let full = format!("{}{}", message, self.config.debug_hint());
        warn!(message = %full, "Reporting error message");
        self.exit.register(exit::codes::CAPTURE_ERROR);
        eprintln!("\n{}", full);
        self.control.error_message(&full);

        if let Err(e) = self.write_log_record(message) {
            warn!(error = %e, "Cannot write error message to the capture output");
        }
    }

    fn write_log_record(&mut self, message: &str) -> Result<()> {
        if self.output.is_closed() {
            let fifo = self
                .config
                .fifo
                .clone()
                .ok_or_else(|| CaptureError::config_error("capture output FIFO not given"))?;
            self.output.open(true, Some(fifo.to_string_lossy().into_owned().as_str()))?;
            debug!("Output opened for error report");
        }
        let encoder = self.transfer.encoder_mut();
        encoder.log_message(message);
        let data = encoder.take_output();
        self.output.write(&data)?;
        self.output.flush()
    }

    fn stop_watchers(&self, termination: &Termination) {
        termination.disable();
        if let Some(watchdog) = &self.watchdog {
            watchdog.stop();
        }
    }

    fn cleanup(&mut self, termination: &Termination) {
        termination.disable();
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop();
            debug!("Watchdog stopped");
        }
        if let Some(mut process) = self.process.take() {
            debug!("Stopping logger process");
            let report = process.stop();
            debug!(attempts = ?report.attempts, exited = report.exited, "Logger process stop finished");
        }
        if let Err(e) = self.input.close() {
            warn!(error = %e, "Closing input pipe failed");
        }
        if let Err(e) = self.output.close() {
            warn!(error = %e, "Closing output pipe failed");
        }
        if self.logger_stdout.take().is_some() {
            debug!("Logger stdout file closed");
        }
        self.control.stop();
        self.set_state(CaptureState::Terminated);
    }

    fn set_state(&mut self, state: CaptureState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Capture state");
            self.state = state;
        }
    }
}

/// Run a blocking open, retrying it when a signal interrupted it without
/// requesting termination.
fn retry_interrupted(termination: &Termination, mut op: impl FnMut() -> Result<()>) -> Result<()> {
    loop {
        match op() {
            Ok(()) => return Ok(()),
            Err(e) => {
                termination.check()?;
                if !e.is_interrupted() {
                    return Err(e);
                }
                debug!("Blocking open interrupted, retrying");
            }
        }
    }
}
