//! Termination signal handling.
//!
//! The analysis tool stops a capture by sending the platform termination
//! signal (`SIGTERM` on unix, a console CTRL-BREAK event on Windows). Internal
//! watchers reuse the same path: they record a [`SignalReason`] and interrupt
//! the capture thread, so every stop condition reaches the orchestrator as one
//! typed [`CaptureError::Terminated`](crate::CaptureError::Terminated).
//!
//! The OS handler only touches atomics. The pending signal is converted into
//! an error by [`Termination::check`] at transfer loop boundaries, and any
//! blocking pipe call outstanding at delivery time returns early with an
//! interrupted error.

use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tracing::{debug, trace};

use crate::{CaptureError, Result};

/// Why a capture is being terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SignalReason {
    /// Unclassified failure.
    Unknown = 0,
    /// The analysis tool asked the capture to stop.
    CaptureStop = 1,
    /// The analysis tool closed the capture output.
    OutputPipe = 2,
    /// The logger side of the input pipe broke.
    InputPipe = 3,
    /// The logger process exited on its own.
    RttProcessExit = 4,
}

impl SignalReason {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SignalReason::CaptureStop,
            2 => SignalReason::OutputPipe,
            3 => SignalReason::InputPipe,
            4 => SignalReason::RttProcessExit,
            _ => SignalReason::Unknown,
        }
    }

    /// Whether the reason is a normal, requested or downstream-driven stop.
    pub fn is_graceful(self) -> bool {
        matches!(self, SignalReason::CaptureStop | SignalReason::OutputPipe)
    }
}

impl fmt::Display for SignalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalReason::Unknown => "UNKNOWN",
            SignalReason::CaptureStop => "CAPTURE_STOP",
            SignalReason::OutputPipe => "OUTPUT_PIPE",
            SignalReason::InputPipe => "INPUT_PIPE",
            SignalReason::RttProcessExit => "RTT_PROCESS_EXIT",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct TerminationState {
    enabled: AtomicBool,
    pending: AtomicBool,
    reason: AtomicU8,
}

impl TerminationState {
    fn new(default_reason: SignalReason) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            pending: AtomicBool::new(false),
            reason: AtomicU8::new(default_reason as u8),
        }
    }

    fn reset(&self, default_reason: SignalReason) {
        self.reason.store(default_reason as u8, Ordering::SeqCst);
        self.pending.store(false, Ordering::SeqCst);
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Called from OS handlers: atomics only.
    fn deliver(&self) -> bool {
        if self.enabled.load(Ordering::SeqCst) {
            self.pending.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

/// State shared with the OS signal handler; one per process.
static INSTALLED: OnceLock<Arc<TerminationState>> = OnceLock::new();

/// Handle to the process termination signal.
///
/// Cloning is cheap; all clones observe the same pending signal. A handle
/// created with [`Termination::install`] is wired to the OS handler and can
/// interrupt the capture thread. [`Termination::manual`] gives the same
/// behaviour without OS hooks.
#[derive(Debug, Clone)]
pub struct Termination {
    state: Arc<TerminationState>,
    hooked: bool,
}

impl Termination {
    /// Install the OS termination handler and bind it to the calling thread.
    ///
    /// The calling thread becomes the capture thread: signals and
    /// [`raise`](Self::raise) calls interrupt its blocking pipe operations.
    pub fn install(default_reason: SignalReason) -> Result<Self> {
        let state = INSTALLED.get_or_init(|| Arc::new(TerminationState::new(default_reason)));
        state.reset(default_reason);
        platform::hook()?;
        debug!(%default_reason, "Termination signal handler installed");
        Ok(Self { state: Arc::clone(state), hooked: true })
    }

    /// Create a termination handle that is not connected to the OS.
    pub fn manual(default_reason: SignalReason) -> Self {
        Self { state: Arc::new(TerminationState::new(default_reason)), hooked: false }
    }

    /// Record `reason` and deliver a termination signal to the capture thread.
    pub fn raise(&self, reason: SignalReason) {
        self.state.reason.store(reason as u8, Ordering::SeqCst);
        debug!(%reason, "Raising termination signal");
        if self.state.deliver() && self.hooked {
            platform::interrupt_capture_thread();
        }
    }

    /// Ignore any further termination signal.
    pub fn disable(&self) {
        self.state.enabled.store(false, Ordering::SeqCst);
        trace!("Termination signal handler disabled");
    }

    /// Whether signals are currently turned into termination conditions.
    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    /// Whether a signal arrived and has not been consumed by [`check`](Self::check).
    pub fn is_pending(&self) -> bool {
        self.is_enabled() && self.state.pending.load(Ordering::SeqCst)
    }

    /// Reason that will be attached to the next termination condition.
    pub fn reason(&self) -> SignalReason {
        SignalReason::from_u8(self.state.reason.load(Ordering::SeqCst))
    }

    /// Convert a pending signal into [`CaptureError::Terminated`].
    pub fn check(&self) -> Result<()> {
        if self.is_enabled() && self.state.pending.swap(false, Ordering::SeqCst) {
            let reason = self.reason();
            debug!(%reason, "Termination signal received");
            return Err(CaptureError::terminated(reason));
        }
        Ok(())
    }
}

#[cfg(unix)]
mod platform {
    use super::INSTALLED;
    use crate::{CaptureError, Result};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// `pthread_t` of the capture thread.
    static CAPTURE_THREAD: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn on_signal(_signal: libc::c_int) {
        let Some(state) = INSTALLED.get() else {
            return;
        };
        if state.deliver() {
            // Any thread may receive a process-directed signal; only the
            // capture thread has blocking calls to interrupt.
            let target = CAPTURE_THREAD.load(Ordering::SeqCst);
            if target != 0 && unsafe { libc::pthread_self() } as usize != target {
                unsafe {
                    libc::pthread_kill(target as libc::pthread_t, libc::SIGTERM);
                }
            }
        }
    }

    pub(super) fn hook() -> Result<()> {
        CAPTURE_THREAD.store(unsafe { libc::pthread_self() } as usize, Ordering::SeqCst);
        for signal in [libc::SIGTERM, libc::SIGINT] {
            // SAFETY: the handler performs atomic loads/stores and pthread_kill,
            // all async-signal-safe. No SA_RESTART so blocking reads and opens
            // return EINTR.
            let rc = unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
                libc::sigemptyset(&mut action.sa_mask);
                action.sa_flags = 0;
                libc::sigaction(signal, &action, std::ptr::null_mut())
            };
            if rc != 0 {
                return Err(CaptureError::pipe_error(
                    "sigaction",
                    "<signal>",
                    io::Error::last_os_error(),
                ));
            }
        }
        Ok(())
    }

    pub(super) fn interrupt_capture_thread() {
        let target = CAPTURE_THREAD.load(Ordering::SeqCst);
        if target != 0 {
            unsafe {
                libc::pthread_kill(target as libc::pthread_t, libc::SIGTERM);
            }
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::INSTALLED;
    use crate::Result;
    use crate::windows::console;
    use windows::Win32::System::Console::{CTRL_BREAK_EVENT, CTRL_C_EVENT, CTRL_CLOSE_EVENT};
    use windows::core::BOOL;

    unsafe extern "system" fn on_console_event(ctrl_type: u32) -> BOOL {
        match ctrl_type {
            CTRL_C_EVENT | CTRL_BREAK_EVENT | CTRL_CLOSE_EVENT => {
                if let Some(state) = INSTALLED.get() {
                    if state.deliver() {
                        console::cancel_capture_io();
                    }
                }
                BOOL(1)
            }
            _ => BOOL(0),
        }
    }

    pub(super) fn hook() -> Result<()> {
        console::bind_capture_thread()?;
        console::set_ctrl_handler(on_console_event)
    }

    pub(super) fn interrupt_capture_thread() {
        console::cancel_capture_io();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_is_ok_without_signal() {
        let termination = Termination::manual(SignalReason::CaptureStop);
        assert!(termination.check().is_ok());
        assert!(!termination.is_pending());
    }

    #[test]
    fn raise_is_converted_once() {
        let termination = Termination::manual(SignalReason::CaptureStop);
        termination.raise(SignalReason::RttProcessExit);

        let err = termination.check().unwrap_err();
        assert_eq!(err.termination_reason(), Some(SignalReason::RttProcessExit));
        assert!(termination.check().is_ok(), "signal must be consumed by check");
    }

    #[test]
    fn disabled_handler_ignores_signals() {
        let termination = Termination::manual(SignalReason::CaptureStop);
        termination.disable();
        termination.raise(SignalReason::OutputPipe);
        assert!(!termination.is_pending());
        assert!(termination.check().is_ok());
    }

    #[test]
    fn clones_share_pending_signal() {
        let termination = Termination::manual(SignalReason::CaptureStop);
        let watcher = termination.clone();
        watcher.raise(SignalReason::InputPipe);
        assert!(termination.is_pending());
        assert_eq!(termination.reason(), SignalReason::InputPipe);
    }

    #[test]
    fn default_reason_applies_to_external_signals() {
        let termination = Termination::manual(SignalReason::CaptureStop);
        termination.state.deliver();
        let err = termination.check().unwrap_err();
        assert_eq!(err.termination_reason(), Some(SignalReason::CaptureStop));
    }

    #[test]
    fn graceful_reasons() {
        assert!(SignalReason::CaptureStop.is_graceful());
        assert!(SignalReason::OutputPipe.is_graceful());
        assert!(!SignalReason::InputPipe.is_graceful());
        assert!(!SignalReason::RttProcessExit.is_graceful());
        assert!(!SignalReason::Unknown.is_graceful());
    }

    #[test]
    fn reason_display_names() {
        assert_eq!(SignalReason::RttProcessExit.to_string(), "RTT_PROCESS_EXIT");
        assert_eq!(SignalReason::from_u8(42), SignalReason::Unknown);
    }
}
