//! Bluetooth monitor stream decoding
//!
//! The logger relays controller traffic in the btmon-compatible monitor
//! format. [`format`] describes the framing, [`parser`] turns a chunked byte
//! stream into [`Record`]s while recovering from corruption.

pub mod format;
pub mod parser;

pub use format::{DropCategory, Drops, InvalidPacket, Packet, Record, opcode, priority};
pub use parser::BtmonParser;
