//! Windows platform layer
//!
//! Named pipes replace POSIX FIFOs and console control events replace
//! signals. Everything here is a thin wrapper over the Win32 calls.
//!
//! # Usage
//!
//! ```rust,ignore
//! use bt_monitor_rtt::pipe::Pipe;
//! use bt_monitor_rtt::windows::NamedPipe;
//!
//! let mut input = NamedPipe::new();
//! let name = input.create(false)?;
//! // hand `name` to the logger, then wait for it to connect
//! input.open(false, None)?;
//! ```

pub mod console;
mod pipe;

pub use pipe::{NAMED_PIPE_BUFFER_SIZE, NAMED_PIPE_PREFIX, NamedPipe};
