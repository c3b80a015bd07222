//! Bluetooth HCI monitor capture over RTT.
//!
//! A Wireshark extcap bridge: the J-Link RTT logger streams Bluetooth monitor
//! frames from the target into a named pipe, and this crate turns them into a
//! live pcap stream (link type 254, `DLT_BLUETOOTH_LINUX_MONITOR`) on the pipe
//! the analysis tool reads.
//!
//! # Pipeline
//!
//! ```text
//! JLinkRTTLogger -> input pipe -> BtmonParser -> PcapEncoder -> output FIFO -> Wireshark
//! ```
//!
//! - [`btmon`]: monitor stream framing and the resynchronizing parser
//! - [`pcap`]: capture container encoding, including synthesized log records
//! - [`pipe`]: named pipe endpoints (POSIX FIFOs, Windows named pipes)
//! - [`capture`]: the orchestrator tying the pipes, the logger process and the
//!   transfer loop together
//!
//! # Example
//!
//! ```rust
//! use bt_monitor_rtt::{BtmonParser, PcapEncoder, PcapOptions};
//!
//! let mut parser = BtmonParser::new();
//! let mut encoder = PcapEncoder::new(PcapOptions::default());
//!
//! // EVENT packet at 2.0 s with a 4-byte payload
//! parser.feed(&[10, 0, 3, 0, 0, 5, 8, 0x20, 0x4E, 0, 0, 0x0E, 0x04, 0x01, 0x00]);
//! for record in parser.drain() {
//!     encoder.generate(&record);
//! }
//! let pcap = encoder.take_output();
//! assert_eq!(pcap.len(), 24 + 16 + 4 + 4);
//! ```

// Core types and error handling
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;

// Stream decoding and encoding
pub mod btmon;
pub mod pcap;

// Capture plumbing
pub mod capture;
pub mod control;
pub mod pipe;
pub mod process;
pub mod signal;
pub mod watchdog;

// Command line surface
pub mod config;
pub mod exit;
pub mod extcap;
pub mod logging;

// Platform-specific modules
#[cfg(windows)]
pub mod windows;

// Core exports
pub use error::*;

pub use btmon::{BtmonParser, InvalidPacket, Packet, Record};
pub use capture::{Capture, CaptureState};
pub use config::{CaptureConfig, Cli};
pub use exit::ExitStatus;
pub use pcap::{PcapEncoder, PcapOptions};
pub use pipe::{Pipe, PlatformPipe};
pub use signal::{SignalReason, Termination};
pub use watchdog::Watchdog;
