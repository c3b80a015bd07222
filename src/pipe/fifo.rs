//! POSIX FIFO pipe endpoint.
//!
//! Opens go through `libc::open` directly: the standard library retries on
//! `EINTR`, which would make a blocked open deaf to the termination signal.
//! Reads are single `read(2)` calls for the same reason.
//!
//! A write to a FIFO whose reader is gone fails with `EPIPE` (the Rust runtime
//! ignores `SIGPIPE`), so [`FifoPipe::writeable`] has nothing to probe.

use std::ffi::CString;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

use super::{Pipe, random_suffix};
use crate::{CaptureError, Result};

/// File name prefix of FIFOs created in the temporary directory.
pub const TEMP_FIFO_PREFIX: &str = "rtt-hci-fifo-";

#[derive(Debug, Default)]
pub struct FifoPipe {
    path: Option<PathBuf>,
    server: bool,
    file: Option<File>,
}

impl FifoPipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the FIFO at a caller-chosen path instead of the temp directory.
    pub fn create_at(&mut self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref().to_path_buf();
        let c_path = c_path(&path)?;
        // SAFETY: c_path is a valid NUL-terminated string.
        if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } != 0 {
            return Err(CaptureError::pipe_error(
                "mkfifo",
                path.display().to_string(),
                io::Error::last_os_error(),
            ));
        }
        debug!(path = %path.display(), "FIFO created");

        let name = path.display().to_string();
        self.path = Some(path);
        self.server = true;
        Ok(name)
    }

    /// Path of the FIFO.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn display_name(&self) -> String {
        self.path.as_ref().map_or_else(|| "<unnamed fifo>".to_string(), |p| p.display().to_string())
    }

    fn file(&mut self, operation: &str) -> Result<&mut File> {
        let pipe = self.display_name();
        self.file.as_mut().ok_or_else(|| {
            CaptureError::pipe_error(
                operation,
                pipe,
                io::Error::new(io::ErrorKind::NotConnected, "pipe is not open"),
            )
        })
    }
}

impl Pipe for FifoPipe {
    fn create(&mut self, _write: bool) -> Result<String> {
        let path = std::env::temp_dir().join(format!("{}{}", TEMP_FIFO_PREFIX, random_suffix(8)));
        self.create_at(path)
    }

    fn open(&mut self, write: bool, name: Option<&str>) -> Result<()> {
        if self.file.is_some() {
            return Err(CaptureError::pipe_error(
                "open",
                self.display_name(),
                io::Error::new(io::ErrorKind::AlreadyExists, "pipe is already open"),
            ));
        }
        let path = match (&self.path, name) {
            (Some(path), _) => path.clone(),
            (None, Some(name)) => PathBuf::from(name),
            (None, None) => {
                return Err(CaptureError::config_error("pipe name is required to open a FIFO"));
            }
        };

        let c_path = c_path(&path)?;
        let flags = libc::O_CLOEXEC | if write { libc::O_WRONLY } else { libc::O_RDONLY };
        trace!(path = %path.display(), write, "Opening FIFO");
        // SAFETY: c_path is a valid NUL-terminated string; the returned fd is
        // owned by the File below.
        let fd = unsafe { libc::open(c_path.as_ptr(), flags) };
        if fd < 0 {
            return Err(CaptureError::pipe_error(
                "open",
                path.display().to_string(),
                io::Error::last_os_error(),
            ));
        }

        self.file = Some(unsafe { File::from_raw_fd(fd) });
        self.path = Some(path);
        debug!(path = %self.display_name(), write, "FIFO opened");
        Ok(())
    }

    fn name(&self) -> Option<&str> {
        self.path.as_deref().and_then(Path::to_str)
    }

    fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn read1(&mut self, max_size: usize) -> Result<Option<Vec<u8>>> {
        let pipe = self.display_name();
        let file = self.file("read")?;
        let mut buffer = vec![0u8; max_size];
        let read = file.read(&mut buffer).map_err(|e| CaptureError::pipe_error("read", pipe, e))?;
        if read == 0 {
            return Ok(None);
        }
        buffer.truncate(read);
        Ok(Some(buffer))
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let pipe = self.display_name();
        self.file("write")?.write_all(data).map_err(|e| CaptureError::pipe_error("write", pipe, e))
    }

    fn writeable(&self) -> bool {
        true
    }

    fn flush(&mut self) -> Result<()> {
        let pipe = self.display_name();
        self.file("flush")?.flush().map_err(|e| CaptureError::pipe_error("flush", pipe, e))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            drop(file);
            trace!(path = %self.display_name(), "FIFO closed");
        }
        if self.server {
            if let Some(path) = &self.path {
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove FIFO");
                }
            }
        }
        self.path = None;
        self.server = false;
        Ok(())
    }
}

impl Drop for FifoPipe {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        CaptureError::config_error(format!("pipe path contains a NUL byte: {}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn create_makes_fifo_in_temp_dir() {
        let mut pipe = FifoPipe::new();
        let name = pipe.create(false).unwrap();

        let path = PathBuf::from(&name);
        assert!(path.file_name().unwrap().to_string_lossy().starts_with(TEMP_FIFO_PREFIX));
        assert!(path.exists());
        assert!(pipe.is_closed(), "create does not open");

        pipe.close().unwrap();
        assert!(!path.exists(), "server side removes the FIFO");
        pipe.close().unwrap();
    }

    #[test]
    fn open_without_name_is_rejected() {
        let mut pipe = FifoPipe::new();
        assert!(matches!(pipe.open(false, None), Err(CaptureError::Config { .. })));
    }

    #[test]
    fn read_and_write_through_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = FifoPipe::new();
        let name = server.create_at(dir.path().join("fifo")).unwrap();

        let writer = thread::spawn(move || {
            let mut client = FifoPipe::new();
            client.open(true, Some(&name)).unwrap();
            client.write(b"monitor bytes").unwrap();
            client.flush().unwrap();
            client.close().unwrap();
        });

        server.open(false, None).unwrap();
        let mut received = Vec::new();
        while let Some(chunk) = server.read1(4).unwrap() {
            assert!(chunk.len() <= 4);
            received.extend(chunk);
        }
        writer.join().unwrap();

        assert_eq!(received, b"monitor bytes");
        assert!(server.writeable());
        server.close().unwrap();
        assert!(server.is_closed());
        assert!(!dir.path().join("fifo").exists());
    }

    #[test]
    fn client_close_keeps_fifo_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        let mut server = FifoPipe::new();
        server.create_at(&path).unwrap();

        let name = path.display().to_string();
        let reader = thread::spawn(move || {
            let mut client = FifoPipe::new();
            client.open(false, Some(&name)).unwrap();
            let data = client.read1(16).unwrap();
            client.close().unwrap();
            data
        });

        server.open(true, None).unwrap();
        server.write(b"x").unwrap();
        assert_eq!(reader.join().unwrap(), Some(b"x".to_vec()));
        assert!(path.exists(), "only the creating side removes the FIFO");

        let err = server.write(b"after reader left").unwrap_err();
        assert!(err.is_broken_pipe());
        server.close().unwrap();
    }

    #[test]
    fn read_requires_open_pipe() {
        let mut pipe = FifoPipe::new();
        assert!(pipe.read1(8).is_err());
    }
}
