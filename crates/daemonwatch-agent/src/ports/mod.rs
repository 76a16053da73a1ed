//! Port usage tracking
//!
//! Attributes ports to the processes using them, for instance to tell which
//! application opened a connection to the tracked process. Mappings are
//! cached, so we only ask the system about ports we haven't resolved yet.

mod lsof;


use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use daemonwatch_common::{PortLookup, ProcessIdentity};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::daemon::{Daemon, DaemonControl, Snapshot, Task, FAILURE_THRESHOLD};

pub use lsof::LsofPortLookup;

struct PortShared {
    /// Ports the last caller asked about
    requested: Mutex<Vec<u16>>,
    /// Every mapping we've learned, retained even once no longer requested
    processes: Snapshot<HashMap<u16, String>>,
}

/// Periodically retrieves the processes using a set of ports.
pub struct PortUsageTracker {
    daemon: Daemon,
    shared: Arc<PortShared>,
}

impl PortUsageTracker {
    pub fn new(rate: Duration, identity: ProcessIdentity, lookup: Arc<dyn PortLookup>) -> Self {
        let shared = Arc::new(PortShared {
            requested: Mutex::new(Vec::new()),
            processes: Snapshot::default(),
        });

        let task = PortTask {
            shared: Arc::clone(&shared),
            lookup,
            failure_count: 0,
        };

        Self {
            daemon: Daemon::new("port_usage", rate, identity, task),
            shared,
        }
    }

    pub fn with_lsof(rate: Duration, identity: ProcessIdentity) -> Self {
        Self::new(rate, identity, Arc::new(LsofPortLookup::new()))
    }

    /// Registers the ports to look up on our next run, and provides the
    /// `port => process` mappings we've retrieved so far. Ports are only
    /// included once a run has resolved them, so callers should keep asking.
    pub fn get_processes_using_ports(&self, ports: &[u16]) -> HashMap<u16, String> {
        *self.shared.requested.lock() = ports.to_vec();
        self.shared.processes.load().as_ref().clone()
    }
}

impl Deref for PortUsageTracker {
    type Target = Daemon;

    fn deref(&self) -> &Daemon {
        &self.daemon
    }
}

struct PortTask {
    shared: Arc<PortShared>,
    lookup: Arc<dyn PortLookup>,
    failure_count: u32,
}

impl Task for PortTask {
    fn run(&mut self, control: &DaemonControl, _pid: u32, _name: &str) -> bool {
        let requested = self.shared.requested.lock().clone();

        if requested.is_empty() {
            return true;
        }

        let cached = self.shared.processes.load();
        let mut remaining: Vec<u16> = requested
            .into_iter()
            .filter(|port| !cached.contains_key(port))
            .collect();

        remaining.sort_unstable();
        remaining.dedup();

        // everything was already resolved
        if remaining.is_empty() {
            self.failure_count = 0;
            return true;
        }

        match self.lookup.processes_for_ports(&remaining) {
            Ok(found) => {
                debug!(requested = remaining.len(), resolved = found.len(), "Resolved port usage");

                let mut processes = cached.as_ref().clone();
                processes.extend(found);
                self.shared.processes.store(processes);

                self.failure_count = 0;
                true
            }
            Err(err) => {
                self.failure_count += 1;

                if self.failure_count >= FAILURE_THRESHOLD {
                    warn!(
                        tracker = "port_usage",
                        error = %err,
                        "Unable to query port usage, giving up"
                    );
                    control.stop();
                } else {
                    debug!(error = %err, parse = err.is_parse(), "Unable to query port usage");
                }

                false
            }
        }
    }
}
