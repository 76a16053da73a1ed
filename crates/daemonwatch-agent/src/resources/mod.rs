//! Resource usage tracking
//!
//! Samples the CPU and memory usage of the tracked process. We read /proc
//! when we can, and fall back to ps when that repeatedly fails.

mod proc_stat;
mod ps;

#[cfg(test)]
mod tests;

use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use daemonwatch_common::{
    LookupError, LookupResult, ProcessIdentity, ResourceBackend, ResourceSample, ResourceSource,
    Resources,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::daemon::{Daemon, DaemonControl, Snapshot, Task, FAILURE_THRESHOLD};

pub use proc_stat::ProcStat;

const PROC_ROOT: &str = "/proc";

/// Samples resource usage through /proc or the ps command
pub struct SystemResourceSource {
    proc_stat: ProcStat,
}

impl SystemResourceSource {
    pub fn new() -> Self {
        Self::with_proc_root(PROC_ROOT)
    }

    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_stat: ProcStat::new(root),
        }
    }

    /// Backend to start with, /proc if this system has it.
    pub fn preferred_backend(&self) -> ResourceBackend {
        if self.proc_stat.is_available() {
            ResourceBackend::Proc
        } else {
            ResourceBackend::Ps
        }
    }
}

impl Default for SystemResourceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSource for SystemResourceSource {
    fn sample(&self, backend: ResourceBackend, pid: u32) -> LookupResult<ResourceSample> {
        match backend {
            ResourceBackend::Proc => self.proc_stat.sample(pid),
            ResourceBackend::Ps => ps::sample(pid),
        }
    }
}

struct ResourceShared {
    /// **None** until our first successful sample
    resources: Snapshot<Option<Resources>>,
    backend: Mutex<ResourceBackend>,
}

/// Periodically samples the resource usage of the tracked process.
pub struct ResourceTracker {
    daemon: Daemon,
    shared: Arc<ResourceShared>,
}

impl ResourceTracker {
    pub fn new(
        rate: Duration,
        identity: ProcessIdentity,
        backend: ResourceBackend,
        source: Arc<dyn ResourceSource>,
    ) -> Self {
        let shared = Arc::new(ResourceShared {
            resources: Snapshot::default(),
            backend: Mutex::new(backend),
        });

        let task = ResourceTask {
            shared: Arc::clone(&shared),
            source,
            failure_count: 0,
        };

        Self {
            daemon: Daemon::new("resources", rate, identity, task),
            shared,
        }
    }

    /// Tracker reading /proc if it's available, and ps otherwise.
    pub fn with_system_source(rate: Duration, identity: ProcessIdentity) -> Self {
        let source = SystemResourceSource::new();
        let backend = source.preferred_backend();
        debug!(%backend, "Determined resource backend");

        Self::new(rate, identity, backend, Arc::new(source))
    }

    /// Last sampled resource usage. This is all zeros until we've taken our
    /// first sample.
    pub fn get_resource_usage(&self) -> Resources {
        (*self.shared.resources.load()).clone().unwrap_or_default()
    }

    /// Mechanism we're currently sampling with
    pub fn backend(&self) -> ResourceBackend {
        *self.shared.backend.lock()
    }
}

impl Deref for ResourceTracker {
    type Target = Daemon;

    fn deref(&self) -> &Daemon {
        &self.daemon
    }
}

struct ResourceTask {
    shared: Arc<ResourceShared>,
    source: Arc<dyn ResourceSource>,
    /// Consecutive failures of our current backend
    failure_count: u32,
}

impl ResourceTask {
    fn handle_failure(
        &mut self,
        control: &DaemonControl,
        backend: ResourceBackend,
        err: &LookupError,
    ) {
        self.failure_count += 1;

        if self.failure_count < FAILURE_THRESHOLD {
            return;
        }

        self.failure_count = 0;

        match backend {
            ResourceBackend::Proc => {
                *self.shared.backend.lock() = ResourceBackend::Ps;
                info!(
                    tracker = "resources",
                    %backend,
                    error = %err,
                    "Unable to sample resource usage from proc, falling back to ps"
                );
            }
            ResourceBackend::Ps => {
                warn!(
                    tracker = "resources",
                    %backend,
                    error = %err,
                    "Unable to sample resource usage from ps, giving up"
                );
                control.stop();
            }
        }
    }
}

impl Task for ResourceTask {
    fn run(&mut self, control: &DaemonControl, pid: u32, _name: &str) -> bool {
        let backend = *self.shared.backend.lock();

        match self.source.sample(backend, pid) {
            Ok(sample) => {
                let previous = self.shared.resources.load();
                let resources = Resources::from_sample(sample, (*previous).as_ref());
                self.shared.resources.store(Some(resources));

                self.failure_count = 0;
                true
            }
            Err(err) => {
                debug!(
                    %backend,
                    error = %err,
                    parse = err.is_parse(),
                    "Resource sampling failed"
                );
                self.handle_failure(control, backend, &err);
                false
            }
        }
    }
}
