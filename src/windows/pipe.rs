//! Native named pipe endpoint.
//!
//! Unlike FIFOs, a write to a named pipe whose reader disconnected does not
//! always fail promptly, so [`NamedPipe::writeable`] issues a zero-length
//! write to detect a departed peer, and the orchestrator polls it from the
//! watchdog through [`Pipe::write_probe`].

use std::io;
use tracing::{debug, trace};
use windows::Win32::Foundation::{
    CloseHandle, ERROR_BROKEN_PIPE, ERROR_NO_DATA, ERROR_OPERATION_ABORTED, ERROR_PIPE_CONNECTED,
    ERROR_PIPE_NOT_CONNECTED, GENERIC_READ, GENERIC_WRITE, HANDLE,
};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAGS_AND_ATTRIBUTES, FILE_SHARE_NONE, FlushFileBuffers, OPEN_EXISTING,
    PIPE_ACCESS_INBOUND, PIPE_ACCESS_OUTBOUND, ReadFile, WriteFile,
};
use windows::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE, PIPE_WAIT,
};
use windows::core::PCWSTR;

use crate::pipe::{Pipe, WriteProbe, random_suffix};
use crate::{CaptureError, Result};

/// Namespace prefix of pipes created by the bridge.
pub const NAMED_PIPE_PREFIX: &str = r"\\.\pipe\rtt_hci_";
/// In and out buffer size of created pipes.
pub const NAMED_PIPE_BUFFER_SIZE: u32 = 256 * 1024;

#[derive(Debug, Default)]
pub struct NamedPipe {
    name: Option<String>,
    server: bool,
    handle: Option<HANDLE>,
}

// SAFETY: the pipe handle is a kernel object usable from any thread; the
// struct is only mutated through &mut self.
unsafe impl Send for NamedPipe {}

impl NamedPipe {
    pub fn new() -> Self {
        Self::default()
    }

    fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "<unnamed pipe>".to_string())
    }

    fn handle(&self, operation: &str) -> Result<HANDLE> {
        self.handle.ok_or_else(|| {
            CaptureError::pipe_error(
                operation,
                self.display_name(),
                io::Error::new(io::ErrorKind::NotConnected, "pipe is not open"),
            )
        })
    }

    fn map_error(&self, operation: &str, error: windows::core::Error) -> CaptureError {
        let code = error.code();
        let kind = if code == ERROR_BROKEN_PIPE.to_hresult()
            || code == ERROR_NO_DATA.to_hresult()
            || code == ERROR_PIPE_NOT_CONNECTED.to_hresult()
        {
            io::ErrorKind::BrokenPipe
        } else if code == ERROR_OPERATION_ABORTED.to_hresult() {
            io::ErrorKind::Interrupted
        } else {
            return CaptureError::windows_api_error(operation, error);
        };
        CaptureError::pipe_error(operation, self.display_name(), io::Error::new(kind, error))
    }
}

impl Pipe for NamedPipe {
    fn create(&mut self, write: bool) -> Result<String> {
        let name = format!("{}{}", NAMED_PIPE_PREFIX, random_suffix(16));
        let wide = wide_string(&name);
        let access = if write { PIPE_ACCESS_OUTBOUND } else { PIPE_ACCESS_INBOUND };

        let handle = unsafe {
            CreateNamedPipeW(
                PCWSTR::from_raw(wide.as_ptr()),
                access,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                1,
                NAMED_PIPE_BUFFER_SIZE,
                NAMED_PIPE_BUFFER_SIZE,
                0,
                None,
            )
        };
        if handle.is_invalid() {
            let win_err = windows::core::Error::from_thread();
            return Err(CaptureError::windows_api_error("CreateNamedPipeW", win_err));
        }

        debug!(name = %name, write, "Named pipe created");
        self.handle = Some(handle);
        self.name = Some(name.clone());
        self.server = true;
        Ok(name)
    }

    fn open(&mut self, write: bool, name: Option<&str>) -> Result<()> {
        if self.server {
            let handle = self.handle("ConnectNamedPipe")?;
            trace!(name = %self.display_name(), "Waiting for named pipe client");
            if let Err(e) = unsafe { ConnectNamedPipe(handle, None) } {
                // The client connected between create and connect.
                if e.code() != ERROR_PIPE_CONNECTED.to_hresult() {
                    return Err(self.map_error("ConnectNamedPipe", e));
                }
            }
            debug!(name = %self.display_name(), "Named pipe client connected");
            return Ok(());
        }

        if self.handle.is_some() {
            return Err(CaptureError::pipe_error(
                "open",
                self.display_name(),
                io::Error::new(io::ErrorKind::AlreadyExists, "pipe is already open"),
            ));
        }
        let name = match (&self.name, name) {
            (Some(name), _) => name.clone(),
            (None, Some(name)) => name.to_string(),
            (None, None) => {
                return Err(CaptureError::config_error("pipe name is required to open a named pipe"));
            }
        };

        let wide = wide_string(&name);
        let access = if write { GENERIC_WRITE.0 } else { GENERIC_READ.0 };
        let handle = unsafe {
            CreateFileW(
                PCWSTR::from_raw(wide.as_ptr()),
                access,
                FILE_SHARE_NONE,
                None,
                OPEN_EXISTING,
                FILE_FLAGS_AND_ATTRIBUTES(0),
                None,
            )
        }
        .map_err(|e| CaptureError::windows_api_error("CreateFileW", e))?;

        debug!(name = %name, write, "Named pipe opened");
        self.handle = Some(handle);
        self.name = Some(name);
        Ok(())
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    fn read1(&mut self, max_size: usize) -> Result<Option<Vec<u8>>> {
        let handle = self.handle("ReadFile")?;
        let mut buffer = vec![0u8; max_size];
        let mut read = 0u32;
        match unsafe { ReadFile(handle, Some(&mut buffer), Some(&mut read), None) } {
            Ok(()) => {}
            Err(e) if e.code() == ERROR_BROKEN_PIPE.to_hresult() => return Ok(None),
            Err(e) => return Err(self.map_error("ReadFile", e)),
        }
        if read == 0 {
            return Ok(None);
        }
        buffer.truncate(read as usize);
        Ok(Some(buffer))
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let handle = self.handle("WriteFile")?;
        let mut offset = 0;
        while offset < data.len() {
            let mut written = 0u32;
            unsafe { WriteFile(handle, Some(&data[offset..]), Some(&mut written), None) }
                .map_err(|e| self.map_error("WriteFile", e))?;
            if written == 0 {
                return Err(CaptureError::broken_pipe(self.display_name()));
            }
            offset += written as usize;
        }
        Ok(())
    }

    fn writeable(&self) -> bool {
        self.handle.is_some_and(probe_handle)
    }

    fn flush(&mut self) -> Result<()> {
        let handle = self.handle("FlushFileBuffers")?;
        unsafe { FlushFileBuffers(handle) }.map_err(|e| self.map_error("FlushFileBuffers", e))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            unsafe {
                let _ = CloseHandle(handle);
            }
            trace!(name = %self.display_name(), "Named pipe closed");
        }
        self.name = None;
        self.server = false;
        Ok(())
    }

    fn write_probe(&self) -> Option<WriteProbe> {
        // Raw value so the probe is Send; the orchestrator unregisters the
        // probe before closing the pipe.
        let raw = self.handle?.0 as usize;
        Some(Box::new(move || probe_handle(HANDLE(raw as *mut std::ffi::c_void))))
    }
}

impl Drop for NamedPipe {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn probe_handle(handle: HANDLE) -> bool {
    let mut written = 0u32;
    let ok = unsafe { WriteFile(handle, Some(&[]), Some(&mut written), None) }.is_ok();
    if !ok {
        debug!("Pipe not writeable, zero-length write failed");
    }
    ok
}

/// Convert string to null-terminated wide string for Windows APIs
fn wide_string(s: &str) -> Vec<u16> {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
}
