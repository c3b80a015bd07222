//! End-to-end captures through real FIFOs with a stand-in logger.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use bt_monitor_rtt::pcap::GLOBAL_HEADER;

/// EVENT packet at 2.0 s carrying `AA BB CC DD`, as octal escapes for printf.
const EVENT_FRAME_PRINTF: &str = r"\012\000\003\000\000\005\010\040\116\000\000\252\273\314\335";

fn write_logger(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("JLinkRTTLogger");
    // The input pipe name is the last argument.
    fs::write(&path, format!("#!/bin/sh\nfor last; do :; done\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn plugin(logger: &Path, output: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_bt-monitor-rtt"));
    command.env_remove("RUST_LOG");
    command
        .args(["--capture", "--extcap-interface", "bt_hci_rtt", "--device", "nRF52840_xxAA"])
        .arg("--logger")
        .arg(logger)
        .arg("--fifo")
        .arg(output);
    command
}

fn find(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[test]
fn logger_exit_is_reported_after_captured_data() {
    let dir = tempfile::tempdir().unwrap();
    let logger = write_logger(
        dir.path(),
        &format!("{{ printf '{}'; sleep 1; }} > \"$last\"", EVENT_FRAME_PRINTF),
    );
    let output = dir.path().join("capture.pcap");
    fs::write(&output, b"").unwrap();

    let result = plugin(&logger, &output).output().expect("plugin runs");
    assert_eq!(result.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("JLinkRTTLogger exited unexpectedly."), "stderr: {}", stderr);

    let capture = fs::read(&output).unwrap();
    assert!(capture.starts_with(&GLOBAL_HEADER));
    let packet_record = [
        2, 0, 0, 0, 0, 0, 0, 0, 8, 0, 0, 0, 8, 0, 0, 0, 0, 0, 0, 3, 0xAA, 0xBB, 0xCC, 0xDD,
    ];
    assert_eq!(&capture[24..48], &packet_record);
    assert!(find(&capture[48..], b"CAPTURE PLUGIN NOTE: JLinkRTTLogger exited unexpectedly.\0"));
}

#[test]
fn missing_device_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let logger = write_logger(dir.path(), "exit 0");
    let output = dir.path().join("capture.pcap");
    fs::write(&output, b"").unwrap();

    let result = Command::new(env!("CARGO_BIN_EXE_bt-monitor-rtt"))
        .args(["--capture", "--device", " "])
        .arg("--logger")
        .arg(&logger)
        .arg("--fifo")
        .arg(&output)
        .output()
        .expect("plugin runs");
    assert_eq!(result.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&result.stderr).contains("Target device not specified!"));

    let capture = fs::read(&output).unwrap();
    assert!(capture.starts_with(&GLOBAL_HEADER));
    assert!(find(&capture, b"Target device not specified!"));
}

#[test]
fn termination_signal_stops_capture_gracefully() {
    let dir = tempfile::tempdir().unwrap();
    let logger = write_logger(dir.path(), "exec sleep 30 > \"$last\"");
    let output = dir.path().join("capture.pcap");
    fs::write(&output, b"").unwrap();

    let mut child = plugin(&logger, &output)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("plugin starts");

    // The header is written once the logger is connected and the handler is in place.
    let deadline = Instant::now() + Duration::from_secs(10);
    while fs::metadata(&output).unwrap().len() < GLOBAL_HEADER.len() as u64 {
        assert!(Instant::now() < deadline, "capture did not start");
        thread::sleep(Duration::from_millis(20));
    }

    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    assert_eq!(rc, 0);
    let result = child.wait_with_output().expect("plugin exits");

    assert_eq!(result.status.code(), Some(0));
    assert!(result.stderr.is_empty(), "stderr: {}", String::from_utf8_lossy(&result.stderr));
    assert_eq!(fs::read(&output).unwrap(), GLOBAL_HEADER.to_vec());
}
