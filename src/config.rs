//! Command line options and capture configuration.
//!
//! The analysis tool starts the bridge once per query (`--extcap-interfaces`,
//! `--extcap-dlts`, `--extcap-config`) and once per capture (`--capture` with
//! the options declared by the config descriptor). It may pass flags the
//! bridge does not know, which are ignored.

use clap::{Args, Parser};
use std::path::PathBuf;
use std::process::Command;

use crate::{CaptureError, Result};

/// Default debug interface of the probe.
pub const DEFAULT_IFACE: &str = "SWD";
/// Default interface speed in kHz.
pub const DEFAULT_SPEED: u32 = 4000;
/// Default RTT channel carrying the monitor stream.
pub const DEFAULT_CHANNEL: u32 = 1;
/// Logger executable looked up in `PATH` when none is configured.
pub const DEFAULT_LOGGER: &str = "JLinkRTTLogger";

/// Reported when the capture starts without a target device.
pub const MISSING_DEVICE_MESSAGE: &str =
    "Target device not specified!\nOpen and change interface configuration.";

/// Bluetooth HCI monitor over RTT, a Wireshark extcap plugin.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "bt-monitor-rtt")]
#[command(version, about, long_about = None, ignore_errors = true)]
pub struct Cli {
    /// List the interfaces provided by the plugin.
    #[arg(long)]
    pub extcap_interfaces: bool,

    /// List the link types of the selected interface.
    #[arg(long)]
    pub extcap_dlts: bool,

    /// List the configuration options of the selected interface.
    #[arg(long)]
    pub extcap_config: bool,

    /// Start capturing into the FIFO given by `--fifo`.
    #[arg(long)]
    pub capture: bool,

    /// Interface selected by the analysis tool.
    #[arg(long)]
    pub extcap_interface: Option<String>,

    /// Version of the analysis tool.
    #[arg(long)]
    pub extcap_version: Option<String>,

    /// Capture filter; the monitor stream is not filtered.
    #[arg(long)]
    pub extcap_capture_filter: Option<String>,

    #[command(flatten)]
    pub capture_args: CaptureArgs,
}

/// Capture options as passed on the command line.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct CaptureArgs {
    /// Target device name as known by the J-Link software.
    #[arg(long, default_value = "")]
    pub device: String,

    /// Target interface.
    #[arg(long, default_value = DEFAULT_IFACE)]
    pub iface: String,

    /// Target interface speed in kHz.
    #[arg(long, default_value_t = DEFAULT_SPEED)]
    pub speed: u32,

    /// RTT channel used by the monitor.
    #[arg(long, default_value_t = DEFAULT_CHANNEL)]
    pub channel: u32,

    /// Serial number of the probe.
    #[arg(long)]
    pub snr: Option<String>,

    /// RTT control block address, or search ranges `<start> <size>[, ...]`.
    #[arg(long)]
    pub addr: Option<String>,

    /// Logger executable.
    #[arg(long)]
    pub logger: Option<String>,

    /// Show system notes as user logging records.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub note_to_log: Option<String>,

    /// Debug log file of the plugin.
    #[arg(long)]
    pub debug: Option<PathBuf>,

    /// File receiving the logger's standard output.
    #[arg(long)]
    pub debug_logger: Option<PathBuf>,

    /// Capture output FIFO created by the analysis tool.
    #[arg(long)]
    pub fifo: Option<PathBuf>,

    /// Control pipe from the analysis tool.
    #[arg(long)]
    pub extcap_control_in: Option<PathBuf>,

    /// Control pipe to the analysis tool.
    #[arg(long)]
    pub extcap_control_out: Option<PathBuf>,
}

/// Validated capture configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub device: String,
    pub iface: String,
    pub speed: u32,
    pub channel: u32,
    pub serial_number: Option<String>,
    pub rtt_address: Option<String>,
    pub logger: String,
    pub note_to_log: bool,
    pub debug_file: Option<PathBuf>,
    pub logger_stdout: Option<PathBuf>,
    pub fifo: Option<PathBuf>,
    pub control_in: Option<PathBuf>,
    pub control_out: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            iface: DEFAULT_IFACE.to_string(),
            speed: DEFAULT_SPEED,
            channel: DEFAULT_CHANNEL,
            serial_number: None,
            rtt_address: None,
            logger: DEFAULT_LOGGER.to_string(),
            note_to_log: false,
            debug_file: None,
            logger_stdout: None,
            fifo: None,
            control_in: None,
            control_out: None,
        }
    }
}

impl From<CaptureArgs> for CaptureConfig {
    fn from(args: CaptureArgs) -> Self {
        let iface = args.iface.trim();
        Self {
            device: args.device.trim().to_string(),
            iface: if iface.is_empty() { DEFAULT_IFACE } else { iface }.to_string(),
            speed: args.speed,
            channel: args.channel,
            serial_number: non_empty(args.snr),
            rtt_address: non_empty(args.addr),
            logger: non_empty(args.logger).unwrap_or_else(|| DEFAULT_LOGGER.to_string()),
            note_to_log: args
                .note_to_log
                .is_some_and(|value| value.trim().eq_ignore_ascii_case("true")),
            debug_file: args.debug.filter(|path| !path.as_os_str().is_empty()),
            logger_stdout: args.debug_logger.filter(|path| !path.as_os_str().is_empty()),
            fifo: args.fifo,
            control_in: args.extcap_control_in,
            control_out: args.extcap_control_out,
        }
    }
}

impl CaptureConfig {
    /// Logger arguments, with the input pipe name last.
    pub fn logger_args(&self, pipe_name: &str) -> Result<Vec<String>> {
        if self.device.is_empty() {
            return Err(CaptureError::config_error(MISSING_DEVICE_MESSAGE));
        }

        let mut args = vec![
            "-Device".to_string(),
            self.device.clone(),
            "-If".to_string(),
            self.iface.clone(),
            "-Speed".to_string(),
            self.speed.to_string(),
            "-RTTChannel".to_string(),
            self.channel.to_string(),
        ];
        if let Some(snr) = &self.serial_number {
            args.extend(["-USB".to_string(), snr.clone()]);
        }
        if let Some(addr) = &self.rtt_address {
            let flag = if addr.contains(' ') { "-RTTSearchRanges" } else { "-RTTAddress" };
            args.extend([flag.to_string(), addr.clone()]);
        }
        args.push(pipe_name.to_string());
        Ok(args)
    }

    /// Logger command reading the monitor stream into `pipe_name`.
    pub fn logger_command(&self, pipe_name: &str) -> Result<Command> {
        let mut command = Command::new(&self.logger);
        command.args(self.logger_args(pipe_name)?);
        Ok(command)
    }

    /// Appended to user-visible error messages.
    pub fn debug_hint(&self) -> String {
        match &self.debug_file {
            Some(path) => format!("\nYou can see more details in debug logs:\n{}", path.display()),
            None => "\nIf you want to see more details, enable debug logs in interface configuration."
                .to_string(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
