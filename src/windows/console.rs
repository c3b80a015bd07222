//! Console control events.
//!
//! The analysis tool stops a capture with a CTRL-BREAK event. The handler runs
//! on a thread of its own, so blocking pipe calls on the capture thread are
//! cancelled with `CancelSynchronousIo` and surface as interrupted errors.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Console::{
    CTRL_BREAK_EVENT, GenerateConsoleCtrlEvent, SetConsoleCtrlHandler,
};
use windows::Win32::System::IO::CancelSynchronousIo;
use windows::Win32::System::Threading::{GetCurrentThreadId, OpenThread, THREAD_TERMINATE};
use windows::core::BOOL;

use crate::{CaptureError, Result};

/// Raw handle of the capture thread, opened with `THREAD_TERMINATE` access
/// as `CancelSynchronousIo` requires.
static CAPTURE_THREAD: AtomicUsize = AtomicUsize::new(0);

/// Console control handler signature.
pub type CtrlHandler = unsafe extern "system" fn(u32) -> BOOL;

/// Remember the calling thread as the one to cancel on termination.
pub fn bind_capture_thread() -> Result<()> {
    let handle = unsafe { OpenThread(THREAD_TERMINATE, false, GetCurrentThreadId()) }
        .map_err(|e| CaptureError::windows_api_error("OpenThread", e))?;
    // The previous handle, if any, is intentionally leaked: the handler
    // could be reading it concurrently.
    CAPTURE_THREAD.store(handle.0 as usize, Ordering::SeqCst);
    trace!("Capture thread bound for I/O cancellation");
    Ok(())
}

pub fn set_ctrl_handler(handler: CtrlHandler) -> Result<()> {
    unsafe { SetConsoleCtrlHandler(Some(handler), true) }
        .map_err(|e| CaptureError::windows_api_error("SetConsoleCtrlHandler", e))?;
    debug!("Console control handler installed");
    Ok(())
}

/// Cancel the blocking I/O call outstanding on the capture thread.
pub fn cancel_capture_io() {
    let raw = CAPTURE_THREAD.load(Ordering::SeqCst);
    if raw != 0 {
        // Fails with ERROR_NOT_FOUND when nothing is pending, which is fine:
        // the pending flag is checked before the next blocking call.
        let _ = unsafe { CancelSynchronousIo(HANDLE(raw as *mut std::ffi::c_void)) };
    }
}

/// Send CTRL-BREAK to a process group created with `CREATE_NEW_PROCESS_GROUP`.
pub fn interrupt_process(pid: u32) -> Result<()> {
    unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) }
        .map_err(|e| CaptureError::windows_api_error("GenerateConsoleCtrlEvent", e))
}
