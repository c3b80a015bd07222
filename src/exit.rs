//! Process exit codes.
//!
//! Several error paths may register a code during one run; the most severe
//! one wins.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::CaptureError;

/// Exit code constants.
pub mod codes {
    /// Capture finished or was stopped normally.
    pub const SUCCESS: i32 = 0;
    /// A failure was reported to the user.
    pub const CAPTURE_ERROR: i32 = 1;
    /// Unexpected failure outside of the capture error paths.
    pub const UNEXPECTED: i32 = 99;
}

/// Max-wins exit code accumulator shared between threads.
#[derive(Debug, Clone, Default)]
pub struct ExitStatus {
    code: Arc<AtomicI32>,
}

impl ExitStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `code`, keeping the highest one seen so far.
    pub fn register(&self, code: i32) {
        self.code.fetch_max(code, Ordering::SeqCst);
    }

    pub fn code(&self) -> i32 {
        self.code.load(Ordering::SeqCst)
    }
}

/// Map an error that escaped the capture to an exit code.
pub fn exit_code(error: &CaptureError) -> i32 {
    match error.termination_reason() {
        Some(reason) if reason.is_graceful() => codes::SUCCESS,
        Some(_) => codes::CAPTURE_ERROR,
        None => codes::UNEXPECTED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SignalReason;

    #[test]
    fn starts_at_success() {
        assert_eq!(ExitStatus::new().code(), codes::SUCCESS);
    }

    #[test]
    fn highest_code_wins() {
        let status = ExitStatus::new();
        status.register(codes::UNEXPECTED);
        status.register(codes::CAPTURE_ERROR);
        status.register(codes::SUCCESS);
        assert_eq!(status.code(), codes::UNEXPECTED);
    }

    #[test]
    fn clones_share_the_code() {
        let status = ExitStatus::new();
        let watcher = status.clone();
        watcher.register(codes::CAPTURE_ERROR);
        assert_eq!(status.code(), codes::CAPTURE_ERROR);
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code(&CaptureError::terminated(SignalReason::CaptureStop)), codes::SUCCESS);
        assert_eq!(exit_code(&CaptureError::terminated(SignalReason::OutputPipe)), codes::SUCCESS);
        assert_eq!(
            exit_code(&CaptureError::terminated(SignalReason::InputPipe)),
            codes::CAPTURE_ERROR
        );
        assert_eq!(exit_code(&CaptureError::broken_pipe("x")), codes::UNEXPECTED);
    }
}
