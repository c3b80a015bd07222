//! Static extcap descriptors printed for the analysis tool's queries.

use crate::config::{DEFAULT_CHANNEL, DEFAULT_SPEED};
use crate::control::{HELP_BUTTON, LOGGER_BUTTON};

/// Interface name used in `--extcap-interface`.
pub const INTERFACE_NAME: &str = "bt_hci_rtt";
/// Interface name shown to the user.
pub const DISPLAY_NAME: &str = "Bluetooth HCI monitor over RTT";
/// Plugin version reported to the analysis tool.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Link type of the produced capture.
pub const DLT_BLUETOOTH_LINUX_MONITOR: u32 = 254;

/// Help page of this plugin version.
pub fn help_url() -> String {
    format!("https://doki-nordic.github.io/bt-monitor-rtt/help-{}.html", VERSION)
}

/// Answer to `--extcap-interfaces`.
pub fn interfaces() -> String {
    [
        format!("extcap {{version={}}}{{help={}}}", VERSION, help_url()),
        format!("interface {{value={}}}{{display={}}}", INTERFACE_NAME, DISPLAY_NAME),
        format!(
            "control {{number={}}}{{type=button}}{{role=logger}}{{display=Log}}{{tooltip=Show capture log}}",
            LOGGER_BUTTON
        ),
        format!(
            "control {{number={}}}{{type=button}}{{role=help}}{{display=Help}}{{tooltip=Show help}}",
            HELP_BUTTON
        ),
    ]
    .join("\n")
}

/// Answer to `--extcap-dlts`.
pub fn dlts() -> String {
    format!(
        "dlt {{number={}}}{{name=DLT_BLUETOOTH_LINUX_MONITOR}}{{display=Bluetooth Linux Monitor}}",
        DLT_BLUETOOTH_LINUX_MONITOR
    )
}

/// Answer to `--extcap-config`.
pub fn config() -> String {
    let args = [
        "arg {number=0}{call=--device}{display=Device}{tooltip=Device name - press Help for full list}{type=string}{required=false}{group=Main}".to_string(),
        "arg {number=1}{call=--iface}{display=Interface}{tooltip=Target interface}{type=selector}{required=false}{group=Main}".to_string(),
        format!("arg {{number=2}}{{call=--speed}}{{display=Speed (kHz)}}{{tooltip=Target speed}}{{type=integer}}{{range=5,50000}}{{default={}}}{{required=false}}{{group=Main}}", DEFAULT_SPEED),
        format!("arg {{number=5}}{{call=--channel}}{{display=RTT Channel}}{{tooltip=RTT channel that monitor uses}}{{type=integer}}{{range=1,99}}{{default={}}}{{required=false}}{{group=Main}}", DEFAULT_CHANNEL),
        "arg {number=3}{call=--snr}{display=Serial Number}{tooltip=Fill if you have more devices connected}{type=string}{required=false}{group=Optional}".to_string(),
        "arg {number=4}{call=--addr}{display=RTT Address}{tooltip=Single address or ranges <Rangestart> <RangeSize>[, <Range1Start> <Range1Size>, ...]}{type=string}{required=false}{group=Optional}".to_string(),
        "arg {number=6}{call=--logger}{display=JLinkRTTLogger Executable}{tooltip=Select your executable if you do not have in your PATH}{type=fileselect}{mustexist=true}{group=Optional}".to_string(),
        "arg {number=7}{call=--note-to-log}{display=Convert System Note to Log}{tooltip=System Note packet will be visible as special User Logging packet}{type=boolean}{group=Optional}".to_string(),
        "arg {number=8}{call=--debug}{display=Debug output}{tooltip=Debug log of this extcap plugin}{type=fileselect}{mustexist=false}{group=Debug}".to_string(),
        "arg {number=9}{call=--debug-logger}{display=JLinkRTTLogger stdout}{tooltip=File that will contain standard output from JLinkRTTLogger}{type=fileselect}{mustexist=false}{group=Debug}".to_string(),
    ];
    let values = ["SWD", "JTAG", "cJTAG", "FINE"].iter().map(|iface| {
        format!(
            "value {{arg=1}}{{value={0}}}{{display={0}}}{{default={1}}}",
            iface,
            *iface == crate::config::DEFAULT_IFACE
        )
    });
    args.into_iter().chain(values).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interfaces_list_plugin_and_toolbar() {
        let text = interfaces();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with(&format!("extcap {{version={}}}", VERSION)));
        assert_eq!(lines[1], "interface {value=bt_hci_rtt}{display=Bluetooth HCI monitor over RTT}");
        assert!(lines[2].starts_with("control {number=0}{type=button}{role=logger}"));
        assert!(lines[3].starts_with("control {number=1}{type=button}{role=help}"));
    }

    #[test]
    fn dlt_is_linux_monitor() {
        assert_eq!(
            dlts(),
            "dlt {number=254}{name=DLT_BLUETOOTH_LINUX_MONITOR}{display=Bluetooth Linux Monitor}"
        );
    }

    #[test]
    fn config_declares_every_capture_option() {
        let text = config();
        for call in [
            "--device",
            "--iface",
            "--speed",
            "--channel",
            "--snr",
            "--addr",
            "--logger",
            "--note-to-log",
            "--debug",
            "--debug-logger",
        ] {
            assert!(text.contains(&format!("{{call={}}}", call)), "missing {}", call);
        }
        assert!(text.contains("{default=4000}"));
        assert!(text.contains("value {arg=1}{value=SWD}{display=SWD}{default=true}"));
        assert!(text.contains("value {arg=1}{value=FINE}{display=FINE}{default=false}"));
    }
}
