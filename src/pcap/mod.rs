//! Capture container output.

pub mod encoder;

pub use encoder::{GLOBAL_HEADER, PcapEncoder, PcapOptions};
