//! Named pipe endpoints connecting the logger and the analysis tool.
//!
//! Both endpoints share the [`Pipe`] capability set. The implementation is
//! chosen once per platform through [`PlatformPipe`]: POSIX FIFOs on unix and
//! native named pipes on Windows.
//!
//! A pipe goes through `unopened -> open -> closed`. The side that calls
//! [`Pipe::create`] owns the filesystem or namespace entry and removes it on
//! [`Pipe::close`].

#[cfg(unix)]
pub mod fifo;

use rand::RngCore;

use crate::Result;

/// Liveness check of an output endpoint that can run on another thread.
pub type WriteProbe = Box<dyn Fn() -> bool + Send>;

/// Bidirectional named pipe endpoint.
pub trait Pipe: Send {
    /// Allocate a uniquely named pipe as the server side and return its name.
    ///
    /// Does not block; the peer connects later through [`open`](Self::open).
    fn create(&mut self, write: bool) -> Result<String>;

    /// Open the pipe.
    ///
    /// For a created pipe this completes the server handshake and may block
    /// until the peer connects. Otherwise `name` selects an existing pipe.
    fn open(&mut self, write: bool, name: Option<&str>) -> Result<()>;

    /// Name of the pipe, once known.
    fn name(&self) -> Option<&str>;

    /// Whether no OS handle is held.
    fn is_closed(&self) -> bool;

    /// Single bounded read. `Ok(None)` means the peer closed its end.
    fn read1(&mut self, max_size: usize) -> Result<Option<Vec<u8>>>;

    /// Write all of `data`, failing with a broken pipe error if the peer left.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Best-effort check whether the peer is still reading.
    fn writeable(&self) -> bool;

    fn flush(&mut self) -> Result<()>;

    /// Release the OS handle and remove a created pipe. Idempotent.
    fn close(&mut self) -> Result<()>;

    /// A liveness probe for platforms where writes do not report a departed
    /// reader. `None` when [`write`](Self::write) already does.
    fn write_probe(&self) -> Option<WriteProbe> {
        None
    }
}

#[cfg(unix)]
pub type PlatformPipe = fifo::FifoPipe;

#[cfg(windows)]
pub type PlatformPipe = crate::windows::NamedPipe;

/// Lowercase hex of `len` random bytes, used to make pipe names unique.
pub(crate) fn random_suffix(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}
