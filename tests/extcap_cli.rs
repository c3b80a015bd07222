//! Extcap query handling of the plugin binary.

use std::process::Command;

fn plugin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_bt-monitor-rtt"))
}

#[test]
fn lists_interface_and_toolbar() {
    let output = plugin()
        .args(["--extcap-interfaces", "--extcap-version=4.2"])
        .output()
        .expect("plugin runs");
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("interface {value=bt_hci_rtt}"));
    assert!(stdout.contains("{role=logger}"));
    assert!(output.stderr.is_empty());
}

#[test]
fn lists_linux_monitor_dlt() {
    let output = plugin()
        .args(["--extcap-dlts", "--extcap-interface", "bt_hci_rtt"])
        .output()
        .expect("plugin runs");
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8(output.stdout).unwrap().trim_end(),
        "dlt {number=254}{name=DLT_BLUETOOTH_LINUX_MONITOR}{display=Bluetooth Linux Monitor}"
    );
}

#[test]
fn config_lists_capture_arguments() {
    let output = plugin()
        .args(["--extcap-config", "--extcap-interface", "bt_hci_rtt"])
        .output()
        .expect("plugin runs");
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.lines().any(|line| line.starts_with("arg {number=0}{call=--device}")));
    assert!(stdout.lines().any(|line| line.contains("{call=--note-to-log}")));
}

#[test]
fn no_action_is_a_no_op() {
    let output = plugin().output().expect("plugin runs");
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
}
