//! Periodic task runner
//!
//! A [`Daemon`] owns one background thread that invokes a [`Task`] at a
//! configurable rate against the process identity it's been told about. The
//! trackers are thin specializations supplying the task and publishing its
//! results through [`Snapshot`] cells.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use daemonwatch_common::{ProcessIdentity, StatusEvent, StatusEventType};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace, warn};

/// Shortest idle wait, bounding how long a stop takes to be noticed
pub const MIN_WAIT: Duration = Duration::from_millis(20);

/// Consecutive failures after which a tracker changes course
pub const FAILURE_THRESHOLD: u32 = 3;

/// Work performed by a [`Daemon`] on each tick.
pub trait Task: Send + 'static {
    /// Performs a single run against the tracked process, providing whether
    /// it was successful.
    fn run(&mut self, control: &DaemonControl, pid: u32, name: &str) -> bool;
}

impl<F> Task for F
where
    F: FnMut(&DaemonControl, u32, &str) -> bool + Send + 'static,
{
    fn run(&mut self, control: &DaemonControl, pid: u32, name: &str) -> bool {
        self(control, pid, name)
    }
}

/// One-way cancellation flag with a wait that wakes as soon as it's set
#[derive(Debug, Default)]
pub struct Halt {
    halted: Mutex<bool>,
    condvar: Condvar,
}

impl Halt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn halt(&self) {
        let mut halted = self.halted.lock();
        *halted = true;
        self.condvar.notify_all();
    }

    pub fn is_halted(&self) -> bool {
        *self.halted.lock()
    }

    /// Blocks for up to `timeout`, returning early if halted. Provides
    /// whether we're halted.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut halted = self.halted.lock();

        if !*halted {
            self.condvar.wait_for(&mut halted, timeout);
        }

        *halted
    }
}

/// Published value that's replaced wholesale, never mutated in place
#[derive(Debug)]
pub struct Snapshot<T> {
    value: RwLock<Arc<T>>,
}

impl<T> Snapshot<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: RwLock::new(Arc::new(value)),
        }
    }

    pub fn load(&self) -> Arc<T> {
        self.value.read().clone()
    }

    pub fn store(&self, value: T) {
        *self.value.write() = Arc::new(value);
    }
}

impl<T: Default> Default for Snapshot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Lifecycle of a daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Created,
    Running,
    Paused,
    Halted,
}

struct Shared {
    name: &'static str,
    /// Guards the identity and the full duration of each task run
    process: Mutex<ProcessIdentity>,
    fallback_name: String,
    rate: Mutex<Duration>,
    run_counter: AtomicU64,
    paused: AtomicBool,
    halt: Halt,
}

/// Handle on a daemon's control state, shared with its task
#[derive(Clone)]
pub struct DaemonControl {
    shared: Arc<Shared>,
}

impl DaemonControl {
    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn rate(&self) -> Duration {
        *self.shared.rate.lock()
    }

    pub fn set_rate(&self, rate: Duration) {
        *self.shared.rate.lock() = rate;
    }

    /// Number of successful runs so far. Callers can compare this against a
    /// prior value to tell if there's new data.
    pub fn run_counter(&self) -> u64 {
        self.shared.run_counter.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Holds off on further work, or resumes it. Ignored once halted.
    pub fn set_paused(&self, paused: bool) {
        if self.is_halted() {
            return;
        }

        self.shared.paused.store(paused, Ordering::SeqCst);
    }

    /// Halts further work. This is irreversible.
    pub fn stop(&self) {
        self.shared.halt.halt();
    }

    pub fn is_halted(&self) -> bool {
        self.shared.halt.is_halted()
    }

    /// Process we're tracking. This blocks while a run is in progress.
    ///
    /// Must not be called from within a [`Task`], since our identity is locked
    /// for the duration of each run. Tasks are handed the pid and name instead.
    pub fn identity(&self) -> ProcessIdentity {
        self.shared.process.lock().clone()
    }

    /// Applies a process identity update.
    pub fn handle_status(&self, event: &StatusEvent) {
        let mut process = self.shared.process.lock();

        if self.is_halted() {
            return;
        }

        match event.event_type {
            StatusEventType::Init | StatusEventType::Reset => {
                process.pid = event.pid;
                process.name = event
                    .name
                    .clone()
                    .unwrap_or_else(|| self.shared.fallback_name.clone());
            }
            StatusEventType::Stopped => {
                process.pid = None;
            }
        }

        debug!(
            tracker = self.shared.name,
            event = ?event.event_type,
            pid = ?process.pid,
            name = %process.name,
            "Process identity updated"
        );
    }
}

/// Performs a task at a set rate on a background thread
pub struct Daemon {
    control: DaemonControl,
    task: Mutex<Option<Box<dyn Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Daemon {
    /// Creates a daemon tracking `identity`. Its name is used as a fallback
    /// whenever a status event doesn't provide one.
    pub fn new(
        name: &'static str,
        rate: Duration,
        identity: ProcessIdentity,
        task: impl Task,
    ) -> Self {
        let shared = Shared {
            name,
            fallback_name: identity.name.clone(),
            process: Mutex::new(identity),
            rate: Mutex::new(rate),
            run_counter: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            halt: Halt::new(),
        };

        Self {
            control: DaemonControl {
                shared: Arc::new(shared),
            },
            task: Mutex::new(Some(Box::new(task))),
            worker: Mutex::new(None),
        }
    }

    /// Begins performing our task. Does nothing if we've already started or
    /// been stopped.
    pub fn start(&self) -> io::Result<()> {
        if self.control.is_halted() {
            return Ok(());
        }

        let Some(task) = self.task.lock().take() else {
            return Ok(());
        };

        let control = self.control.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-tracker", self.control.name()))
            .spawn(move || run_loop(control, task))?;

        *self.worker.lock() = Some(handle);
        debug!(tracker = self.control.name(), "Tracker started");
        Ok(())
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    /// Waits for our thread to terminate. Callers should [`stop`](Self::stop)
    /// us first.
    pub fn join(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };

        if handle.thread().id() == thread::current().id() {
            return;
        }

        if handle.join().is_err() {
            warn!(tracker = self.control.name(), "Tracker thread panicked");
        }
    }

    pub fn control(&self) -> &DaemonControl {
        &self.control
    }

    pub fn state(&self) -> DaemonState {
        if self.control.is_halted() {
            DaemonState::Halted
        } else if self.task.lock().is_some() {
            DaemonState::Created
        } else if self.control.is_paused() {
            DaemonState::Paused
        } else {
            DaemonState::Running
        }
    }

    /// True if our thread has been started and hasn't yet terminated
    pub fn is_alive(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn rate(&self) -> Duration {
        self.control.rate()
    }

    pub fn set_rate(&self, rate: Duration) {
        self.control.set_rate(rate)
    }

    pub fn run_counter(&self) -> u64 {
        self.control.run_counter()
    }

    pub fn set_paused(&self, paused: bool) {
        self.control.set_paused(paused)
    }

    pub fn is_halted(&self) -> bool {
        self.control.is_halted()
    }

    pub fn handle_status(&self, event: &StatusEvent) {
        self.control.handle_status(event)
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn run_loop(control: DaemonControl, mut task: Box<dyn Task>) {
    let shared = &control.shared;
    let mut last_ran: Option<Instant> = None;

    while !shared.halt.is_halted() {
        let rate = control.rate();
        let elapsed = last_ran.map(|t| t.elapsed());
        let is_due = elapsed.map_or(true, |e| e >= rate);

        if control.is_paused() || !is_due {
            let remaining = elapsed.map_or(rate, |e| rate.saturating_sub(e));
            shared.halt.wait(remaining.max(MIN_WAIT));
            continue;
        }

        {
            let process = shared.process.lock();

            let is_successful = match process.pid {
                Some(pid) => task.run(&control, pid, &process.name),
                None => false,
            };

            if is_successful {
                shared.run_counter.fetch_add(1, Ordering::SeqCst);
            }

            trace!(tracker = shared.name, is_successful, "Tracker run finished");
        }

        last_ran = Some(Instant::now());
    }

    debug!(tracker = shared.name, "Tracker stopped");
}
