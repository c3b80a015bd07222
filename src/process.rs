//! External logger process supervision.
//!
//! [`WatchedProcess`] owns the logger child process. While it runs, a
//! watchdog probe reports an exit that nobody asked for. [`WatchedProcess::stop`]
//! escalates from interrupt to terminate to kill, giving the process a bounded
//! amount of time after each step.

use parking_lot::Mutex;
use std::fmt;
use std::process::{Child, Command, ExitStatus};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::watchdog::{ProbeId, ProbeStatus, Watchdog};
use crate::{CaptureError, Result};

/// How long [`WatchedProcess::stop`] waits after each escalation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    /// Exit polls per step.
    pub polls: u32,
    /// Delay between polls.
    pub interval: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self { polls: 40, interval: Duration::from_millis(300) }
    }
}

/// One step of the stop escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// SIGINT on unix, CTRL-BREAK to the process group on Windows.
    Interrupt,
    /// SIGTERM on unix.
    Terminate,
    Kill,
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Escalation::Interrupt => f.write_str("interrupt"),
            Escalation::Terminate => f.write_str("terminate"),
            Escalation::Kill => f.write_str("kill"),
        }
    }
}

/// Outcome of [`WatchedProcess::stop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// Escalation steps sent, in order.
    pub attempts: Vec<Escalation>,
    /// Whether the process is known to have exited.
    pub exited: bool,
    pub status: Option<ExitStatus>,
}

/// A child process whose unexpected exit is reported through the watchdog.
pub struct WatchedProcess {
    child: Arc<Mutex<Child>>,
    pid: u32,
    command: String,
    watchdog: Watchdog,
    watcher: Option<ProbeId>,
    policy: StopPolicy,
}

impl fmt::Debug for WatchedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchedProcess")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("watched", &self.watcher.is_some())
            .field("policy", &self.policy)
            .finish()
    }
}

impl WatchedProcess {
    /// Spawn `command` and watch it.
    ///
    /// `on_exit` runs on the watchdog thread, at most once, if the process
    /// exits before [`stop`](Self::stop) is called.
    pub fn spawn(
        mut command: Command,
        watchdog: &Watchdog,
        on_exit: impl FnOnce(Option<ExitStatus>) + Send + 'static,
    ) -> Result<Self> {
        let description = describe(&command);
        prepare(&mut command);
        let child = command.spawn().map_err(|e| CaptureError::process_error(&description, e))?;
        let pid = child.id();
        info!(pid, command = %description, "Logger process started");

        let child = Arc::new(Mutex::new(child));
        let watched = Arc::clone(&child);
        let mut on_exit = Some(on_exit);
        let watcher = watchdog.add(move || {
            let status = watched.lock().try_wait();
            match status {
                Ok(None) => Ok(ProbeStatus::Continue),
                Ok(Some(status)) => {
                    warn!(pid, %status, "Logger process exited unexpectedly");
                    if let Some(callback) = on_exit.take() {
                        callback(Some(status));
                    }
                    Ok(ProbeStatus::Stop)
                }
                Err(e) => {
                    warn!(pid, error = %e, "Cannot query logger process state");
                    if let Some(callback) = on_exit.take() {
                        callback(None);
                    }
                    Ok(ProbeStatus::Stop)
                }
            }
        });

        Ok(Self {
            child,
            pid,
            command: description,
            watchdog: watchdog.clone(),
            watcher: Some(watcher),
            policy: StopPolicy::default(),
        })
    }

    /// Replace the stop escalation timing.
    pub fn with_policy(mut self, policy: StopPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Exit status if the process has exited.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.child.lock().try_wait().ok().flatten()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(None))
    }

    /// Stop watching and make sure the process is gone.
    ///
    /// Never fails: a process that survives every step is logged and left
    /// alone so shutdown can complete.
    pub fn stop(&mut self) -> StopReport {
        if let Some(id) = self.watcher.take() {
            self.watchdog.remove(id);
        }

        let mut report = StopReport { attempts: Vec::new(), exited: false, status: None };
        if let Some(status) = self.exit_status() {
            debug!(pid = self.pid, %status, "Logger process already exited");
            report.exited = true;
            report.status = Some(status);
            return report;
        }

        for step in [Escalation::Interrupt, Escalation::Terminate, Escalation::Kill] {
            info!(pid = self.pid, %step, "Stopping logger process");
            report.attempts.push(step);
            if let Err(e) = self.send(step) {
                warn!(pid = self.pid, %step, error = %e, "Cannot signal logger process");
            }
            if let Some(status) = self.wait_for_exit() {
                info!(pid = self.pid, %status, "Logger process stopped");
                report.exited = true;
                report.status = Some(status);
                return report;
            }
        }

        warn!(pid = self.pid, "Logger process survived kill, giving up");
        report
    }

    fn wait_for_exit(&self) -> Option<ExitStatus> {
        for _ in 0..self.policy.polls {
            if let Some(status) = self.exit_status() {
                return Some(status);
            }
            trace!(pid = self.pid, "Waiting for logger process exit");
            thread::sleep(self.policy.interval);
        }
        self.exit_status()
    }

    fn send(&self, step: Escalation) -> Result<()> {
        match step {
            Escalation::Kill => self
                .child
                .lock()
                .kill()
                .map_err(|e| CaptureError::process_error(&self.command, e)),
            step => platform::signal(self.pid, step, &self.child),
        }
    }
}

impl Drop for WatchedProcess {
    fn drop(&mut self) {
        if let Some(id) = self.watcher.take() {
            self.watchdog.remove(id);
        }
    }
}

fn describe(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(unix)]
fn prepare(_command: &mut Command) {}

#[cfg(windows)]
fn prepare(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    use windows::Win32::System::Threading::CREATE_NEW_PROCESS_GROUP;
    // CTRL-BREAK can only be sent to a process group.
    command.creation_flags(CREATE_NEW_PROCESS_GROUP.0);
}

#[cfg(unix)]
mod platform {
    use super::Escalation;
    use crate::{CaptureError, Result};
    use parking_lot::Mutex;
    use std::io;
    use std::process::Child;

    pub(super) fn signal(pid: u32, step: Escalation, _child: &Mutex<Child>) -> Result<()> {
        let signal = match step {
            Escalation::Interrupt => libc::SIGINT,
            Escalation::Terminate => libc::SIGTERM,
            Escalation::Kill => libc::SIGKILL,
        };
        // SAFETY: pid belongs to a child we have not reaped yet.
        if unsafe { libc::kill(pid as libc::pid_t, signal) } != 0 {
            return Err(CaptureError::process_error(
                format!("kill -{} {}", signal, pid),
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }
}

#[cfg(windows)]
mod platform {
    use super::Escalation;
    use crate::windows::console;
    use crate::{CaptureError, Result};
    use parking_lot::Mutex;
    use std::process::Child;

    pub(super) fn signal(pid: u32, step: Escalation, child: &Mutex<Child>) -> Result<()> {
        match step {
            Escalation::Interrupt => console::interrupt_process(pid),
            Escalation::Terminate | Escalation::Kill => child
                .lock()
                .kill()
                .map_err(|e| CaptureError::process_error(format!("TerminateProcess {}", pid), e)),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Instant;

    fn quiet_watchdog() -> Watchdog {
        Watchdog::with_tick(Duration::from_millis(20), |err| panic!("watchdog failure: {}", err))
            .unwrap()
    }

    fn fast_policy() -> StopPolicy {
        StopPolicy { polls: 20, interval: Duration::from_millis(50) }
    }

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[test]
    fn unexpected_exit_is_reported_once() {
        let watchdog = quiet_watchdog();
        let (tx, rx) = mpsc::channel();
        let process = WatchedProcess::spawn(shell("exit 3"), &watchdog, move |status| {
            let _ = tx.send(status);
        })
        .unwrap();

        let status = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(status.code(), Some(3));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err(), "reported only once");
        assert!(!process.is_running());
        watchdog.stop();
    }

    #[test]
    fn stop_does_not_report_exit() {
        let watchdog = quiet_watchdog();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut sleeper = Command::new("sleep");
        sleeper.arg("30");
        let mut process = WatchedProcess::spawn(sleeper, &watchdog, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap()
        .with_policy(fast_policy());

        let report = process.stop();
        assert_eq!(report.attempts, vec![Escalation::Interrupt]);
        assert!(report.exited);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(watchdog.is_empty());
        watchdog.stop();
    }

    #[test]
    fn ignored_interrupt_escalates_to_terminate() {
        let watchdog = quiet_watchdog();
        let mut process = WatchedProcess::spawn(
            shell("trap '' INT; while true; do sleep 0.1; done"),
            &watchdog,
            |_| {},
        )
        .unwrap()
        .with_policy(fast_policy());
        // Let the shell install its trap.
        thread::sleep(Duration::from_millis(300));

        let started = Instant::now();
        let report = process.stop();
        assert_eq!(report.attempts, vec![Escalation::Interrupt, Escalation::Terminate]);
        assert!(report.exited);
        assert!(started.elapsed() < Duration::from_secs(5));
        watchdog.stop();
    }

    #[test]
    fn stop_after_exit_sends_nothing() {
        let watchdog = quiet_watchdog();
        let mut process = WatchedProcess::spawn(shell("true"), &watchdog, |_| {}).unwrap();
        thread::sleep(Duration::from_millis(300));

        let report = process.stop();
        assert!(report.attempts.is_empty());
        assert!(report.exited);
        watchdog.stop();
    }

    #[test]
    fn spawn_failure_names_the_command() {
        let watchdog = quiet_watchdog();
        let err = WatchedProcess::spawn(
            Command::new("/nonexistent/JLinkRTTLogger"),
            &watchdog,
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, CaptureError::Process { .. }));
        assert!(err.to_string().contains("/nonexistent/JLinkRTTLogger"));
        watchdog.stop();
    }

    #[test]
    fn default_policy_bounds_each_step() {
        let policy = StopPolicy::default();
        assert_eq!(policy.polls, 40);
        assert_eq!(policy.interval, Duration::from_millis(300));
    }
}
