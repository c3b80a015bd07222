//! Extcap entry point.

use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;

use bt_monitor_rtt::exit::codes;
use bt_monitor_rtt::{Capture, CaptureConfig, Cli, extcap, logging};

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("\nUnexpected exception occurred: {:#}", e);
            ExitCode::from(codes::UNEXPECTED as u8)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    if cli.extcap_interfaces {
        println!("{}", extcap::interfaces());
        return Ok(codes::SUCCESS);
    }
    if cli.extcap_dlts {
        println!("{}", extcap::dlts());
        return Ok(codes::SUCCESS);
    }
    if cli.extcap_config {
        println!("{}", extcap::config());
        return Ok(codes::SUCCESS);
    }
    if !cli.capture {
        return Ok(codes::SUCCESS);
    }

    let config = CaptureConfig::from(cli.capture_args);
    logging::init(config.debug_file.as_deref()).context("cannot set up debug output")?;
    tracing::info!(
        version = extcap::VERSION,
        analysis_tool = cli.extcap_version.as_deref().unwrap_or("unknown"),
        ?config,
        "Capture requested"
    );
    Ok(Capture::new(config).run())
}
