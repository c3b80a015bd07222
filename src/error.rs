//! Error types for the capture bridge.
//!
//! Every failure that can end a capture is funnelled through [`CaptureError`]
//! so the orchestrator writes its cleanup path exactly once.
//!
//! ## Error Categories
//!
//! - **Termination**: the typed termination condition carrying a [`SignalReason`]
//! - **Pipe Errors**: broken peers and failed pipe operations
//! - **Process Errors**: the external logger could not be started
//! - **Configuration Errors**: missing or unusable capture options
//! - **Watchdog Errors**: a liveness probe failed or panicked
//! - **Windows API Errors**: platform-specific named pipe and console failures
//!
//! Protocol corruption is deliberately absent: the parser recovers from it
//! locally and reports it as an [`InvalidPacket`](crate::btmon::InvalidPacket).
//!
//! ```rust
//! use bt_monitor_rtt::{CaptureError, SignalReason};
//!
//! let error = CaptureError::terminated(SignalReason::OutputPipe);
//! assert_eq!(error.termination_reason(), Some(SignalReason::OutputPipe));
//! assert!(!error.is_broken_pipe());
//! ```

use std::io;
use thiserror::Error;

use crate::signal::SignalReason;

#[cfg(windows)]
use windows_core as core;

/// Result type alias for capture operations.
pub type Result<T, E = CaptureError> = std::result::Result<T, E>;

/// Main error type for capture operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CaptureError {
    #[error("Capture terminated: {reason}")]
    Terminated { reason: SignalReason },

    #[error("Pipe {pipe} is broken")]
    BrokenPipe { pipe: String },

    #[error("Pipe operation '{operation}' failed on {pipe}")]
    Pipe {
        operation: String,
        pipe: String,
        #[source]
        source: io::Error,
    },

    #[error("Cannot start logger process '{command}'")]
    Process {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Watchdog probe failed: {details}")]
    Watchdog { details: String },

    #[error("Windows API error: {operation}")]
    #[cfg(windows)]
    WindowsApi {
        operation: String,
        #[source]
        source: core::Error,
    },
}

impl CaptureError {
    /// Whether this error means a pipe peer went away.
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            CaptureError::BrokenPipe { .. } => true,
            CaptureError::Pipe { source, .. } => source.kind() == io::ErrorKind::BrokenPipe,
            _ => false,
        }
    }

    /// Whether a blocking call was interrupted before completing.
    ///
    /// The orchestrator answers this by checking for a pending termination
    /// signal and retrying the call if there is none.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, CaptureError::Pipe { source, .. } if source.kind() == io::ErrorKind::Interrupted)
    }

    /// The termination reason, if this is the typed termination condition.
    pub fn termination_reason(&self) -> Option<SignalReason> {
        match self {
            CaptureError::Terminated { reason } => Some(*reason),
            _ => None,
        }
    }

    /// Helper constructor for the typed termination condition.
    pub fn terminated(reason: SignalReason) -> Self {
        CaptureError::Terminated { reason }
    }

    /// Helper constructor for broken pipe errors.
    pub fn broken_pipe(pipe: impl Into<String>) -> Self {
        CaptureError::BrokenPipe { pipe: pipe.into() }
    }

    /// Helper constructor for pipe operation errors.
    ///
    /// An OS broken-pipe error is folded into [`CaptureError::BrokenPipe`] so
    /// callers classify it the same way on every platform.
    pub fn pipe_error(operation: impl Into<String>, pipe: impl Into<String>, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::BrokenPipe {
            return CaptureError::BrokenPipe { pipe: pipe.into() };
        }
        CaptureError::Pipe { operation: operation.into(), pipe: pipe.into(), source }
    }

    /// Helper constructor for logger process start failures.
    pub fn process_error(command: impl Into<String>, source: io::Error) -> Self {
        CaptureError::Process { command: command.into(), source }
    }

    /// Helper constructor for configuration errors.
    pub fn config_error(reason: impl Into<String>) -> Self {
        CaptureError::Config { reason: reason.into() }
    }

    /// Helper constructor for watchdog failures.
    pub fn watchdog_error(details: impl Into<String>) -> Self {
        CaptureError::Watchdog { details: details.into() }
    }

    /// Helper constructor for Windows API errors.
    #[cfg(windows)]
    pub fn windows_api_error(operation: impl Into<String>, source: core::Error) -> Self {
        CaptureError::WindowsApi { operation: operation.into(), source }
    }
}

impl From<io::Error> for CaptureError {
    fn from(err: io::Error) -> Self {
        CaptureError::pipe_error("io", "<unknown>", err)
    }
}

#[cfg(windows)]
impl From<core::Error> for CaptureError {
    fn from(err: core::Error) -> Self {
        CaptureError::WindowsApi { operation: "Unknown Windows operation".to_string(), source: err }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn error_messages_carry_their_context(
                pipe in "[a-z/_-]{1,32}",
                operation in "[a-z]{1,12}",
                reason in ".*",
            ) {
                let broken = CaptureError::broken_pipe(pipe.clone());
                prop_assert!(broken.to_string().contains(&pipe));

                let failed = CaptureError::pipe_error(
                    operation.clone(),
                    pipe.clone(),
                    io::Error::other("boom"),
                );
                let message = failed.to_string();
                prop_assert!(message.contains(&operation));
                prop_assert!(message.contains(&pipe));

                let config = CaptureError::config_error(reason.clone());
                prop_assert!(config.to_string().contains(&reason));
            }
        }
    }

    #[test]
    fn os_broken_pipe_is_folded_into_broken_pipe_variant() {
        let err = CaptureError::pipe_error(
            "write",
            "/tmp/out",
            io::Error::new(io::ErrorKind::BrokenPipe, "EPIPE"),
        );
        assert!(matches!(err, CaptureError::BrokenPipe { .. }));
        assert!(err.is_broken_pipe());
    }

    #[test]
    fn interrupted_is_detected_only_for_pipe_errors() {
        let interrupted = CaptureError::pipe_error(
            "read",
            "/tmp/in",
            io::Error::new(io::ErrorKind::Interrupted, "EINTR"),
        );
        assert!(interrupted.is_interrupted());
        assert!(!interrupted.is_broken_pipe());

        assert!(!CaptureError::broken_pipe("x").is_interrupted());
        assert!(!CaptureError::terminated(SignalReason::CaptureStop).is_interrupted());
    }

    #[test]
    fn termination_reason_is_only_set_for_terminated() {
        let err = CaptureError::terminated(SignalReason::RttProcessExit);
        assert_eq!(err.termination_reason(), Some(SignalReason::RttProcessExit));
        assert_eq!(CaptureError::broken_pipe("x").termination_reason(), None);
    }

    #[test]
    fn from_io_error_keeps_kind() {
        let err: CaptureError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(err.is_broken_pipe());

        let err: CaptureError = io::Error::new(io::ErrorKind::PermissionDenied, "no").into();
        match err {
            CaptureError::Pipe { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied)
            }
            other => panic!("Expected Pipe error, got {:?}", other),
        }
    }

    #[test]
    fn error_is_send_sync_static() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<CaptureError>();
    }
}
