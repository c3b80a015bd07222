//! Periodic liveness probes on a single background thread.
//!
//! Probes are small non-blocking checks ("has the logger exited", "is the
//! output pipe still read") registered under a stable [`ProbeId`]. Every tick
//! the watchdog takes its lock, runs each probe once and drops the ones that
//! return [`ProbeStatus::Stop`]. The lock is released while sleeping, so
//! [`Watchdog::add`] and [`Watchdog::remove`] never wait longer than one scan.
//!
//! A probe that fails or panics ends the watchdog; the failure goes to the
//! exception handler given to [`Watchdog::start`].
//!
//! Probes run with the lock held and must not call `add` or `remove`.
//! Calling [`Watchdog::stop`] from a probe is fine.

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, trace};

use crate::{CaptureError, Result};

/// Default interval between probe scans.
pub const TICK_TIME: Duration = Duration::from_millis(500);

/// What a probe wants after running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// Keep the probe registered.
    Continue,
    /// Remove the probe.
    Stop,
}

/// Stable identifier of a registered probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProbeId(u64);

/// A registered liveness check.
pub type Probe = Box<dyn FnMut() -> Result<ProbeStatus> + Send>;

/// Receives the failure that ended the watchdog loop.
pub type ExceptionHandler = Box<dyn Fn(CaptureError) + Send + Sync>;

struct Shared {
    running: AtomicBool,
    next_id: AtomicU64,
    probes: Mutex<BTreeMap<ProbeId, Probe>>,
    wakeup: Condvar,
}

struct Inner {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

/// Handle to the watchdog thread. Clones refer to the same thread.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("running", &self.is_running())
            .field("thread_id", &self.inner.thread_id)
            .finish()
    }
}

impl Watchdog {
    /// Start the watchdog thread with the default tick.
    pub fn start(handler: impl Fn(CaptureError) + Send + Sync + 'static) -> Result<Self> {
        Self::with_tick(TICK_TIME, handler)
    }

    /// Start the watchdog thread scanning every `tick`.
    pub fn with_tick(
        tick: Duration,
        handler: impl Fn(CaptureError) + Send + Sync + 'static,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(0),
            probes: Mutex::new(BTreeMap::new()),
            wakeup: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handler: ExceptionHandler = Box::new(handler);
        let handle = thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || run(thread_shared, handler, tick))
            .map_err(|e| CaptureError::watchdog_error(format!("cannot spawn thread: {}", e)))?;

        let thread_id = handle.thread().id();
        Ok(Self { inner: Arc::new(Inner { shared, thread: Mutex::new(Some(handle)), thread_id }) })
    }

    /// Register a probe to run on every tick.
    pub fn add(&self, probe: impl FnMut() -> Result<ProbeStatus> + Send + 'static) -> ProbeId {
        let id = ProbeId(self.inner.shared.next_id.fetch_add(1, Ordering::SeqCst));
        self.inner.shared.probes.lock().insert(id, Box::new(probe));
        trace!(?id, "Watchdog probe added");
        id
    }

    /// Unregister a probe. Returns whether it was still registered.
    ///
    /// Once this returns, the probe is not running and will not run again.
    pub fn remove(&self, id: ProbeId) -> bool {
        let removed = self.inner.shared.probes.lock().remove(&id).is_some();
        trace!(?id, removed, "Watchdog probe removed");
        removed
    }

    /// Number of registered probes.
    pub fn len(&self) -> usize {
        self.inner.shared.probes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.inner.shared.running.load(Ordering::SeqCst)
    }

    /// Stop the thread. Safe from any thread, including from inside a probe.
    ///
    /// From other threads this waits for the watchdog thread to finish.
    pub fn stop(&self) {
        self.inner.shared.running.store(false, Ordering::SeqCst);
        if thread::current().id() == self.inner.thread_id {
            return;
        }
        // The thread checks `running` under the lock before it sleeps.
        drop(self.inner.shared.probes.lock());
        self.inner.shared.wakeup.notify_all();
        if let Some(handle) = self.inner.thread.lock().take() {
            if handle.join().is_err() {
                error!("Watchdog thread panicked");
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wakeup.notify_all();
    }
}

fn run(shared: Arc<Shared>, handler: ExceptionHandler, tick: Duration) {
    debug!("Watchdog thread started");
    let mut failure = None;
    {
        let mut probes = shared.probes.lock();
        'scan: while shared.running.load(Ordering::SeqCst) {
            let ids: Vec<ProbeId> = probes.keys().copied().collect();
            for id in ids {
                let Some(probe) = probes.get_mut(&id) else {
                    continue;
                };
                match catch_unwind(AssertUnwindSafe(probe)) {
                    Ok(Ok(ProbeStatus::Continue)) => {}
                    Ok(Ok(ProbeStatus::Stop)) => {
                        probes.remove(&id);
                        trace!(?id, "Watchdog probe finished");
                    }
                    Ok(Err(err)) => {
                        failure = Some(err);
                        break 'scan;
                    }
                    Err(panic) => {
                        failure = Some(CaptureError::watchdog_error(panic_message(&panic)));
                        break 'scan;
                    }
                }
                if !shared.running.load(Ordering::SeqCst) {
                    break 'scan;
                }
            }
            if !shared.running.load(Ordering::SeqCst) {
                break;
            }
            shared.wakeup.wait_for(&mut probes, tick);
        }
    }

    if let Some(err) = failure {
        shared.running.store(false, Ordering::SeqCst);
        error!(error = %err, "Watchdog probe failed");
        handler(err);
    }
    debug!("Watchdog thread stopped");
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("probe panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("probe panicked: {}", message)
    } else {
        "probe panicked".to_string()
    }
}
