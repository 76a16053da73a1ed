//! Connection tracking
//!
//! Periodically lists the connections the tracked process has established,
//! failing over between resolvers and backing off its rate when lookups are
//! expensive.

mod commands;
mod proc_net;


use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use daemonwatch_common::{
    Connection, ConnectionResolver, LookupError, LookupResult, ProcessIdentity, Resolver,
    ResolverList,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::command;
use crate::daemon::{Daemon, DaemonControl, Snapshot, Task, FAILURE_THRESHOLD};

pub use commands::split_address;
pub use proc_net::ProcNet;

/// Lookups must take under one percent of our rate
const RUNTIME_TO_RATE_RATIO: u32 = 100;

/// Extra time added when raising our rate so we don't adjust it constantly
const RATE_PADDING: Duration = Duration::from_secs(1);

const PROC_ROOT: &str = "/proc";

/// Resolves connections through /proc and the system's netstat, ss, or lsof
pub struct SystemResolver {
    proc_net: ProcNet,
}

impl SystemResolver {
    pub fn new() -> Self {
        Self::with_proc_root(PROC_ROOT)
    }

    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_net: ProcNet::new(root),
        }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionResolver for SystemResolver {
    fn connections(
        &self,
        resolver: Resolver,
        pid: u32,
        _name: &str,
    ) -> LookupResult<Vec<Connection>> {
        match resolver {
            Resolver::Proc => self.proc_net.connections(pid),
            other => commands::query(other, pid),
        }
    }
}

/// Resolvers usable on this system, in the order we should try them.
pub fn system_resolvers() -> Vec<Resolver> {
    let mut resolvers = Vec::new();

    if ProcNet::new(PROC_ROOT).is_available() {
        resolvers.push(Resolver::Proc);
    }

    for resolver in [Resolver::Netstat, Resolver::Ss, Resolver::Lsof] {
        if let Some(cmd) = resolver.command() {
            if command::find_executable(cmd).is_some() {
                resolvers.push(resolver);
            }
        }
    }

    debug!(?resolvers, "Determined connection resolvers");
    resolvers
}

struct ConnectionShared {
    connections: Snapshot<Vec<Connection>>,
    resolvers: Mutex<ResolverList>,
}

/// Periodically retrieves the connections established by the tracked process.
///
/// Dereferences to its [`Daemon`] for start, stop, pausing, and rate control.
pub struct ConnectionTracker {
    daemon: Daemon,
    shared: Arc<ConnectionShared>,
}

impl ConnectionTracker {
    pub fn new(
        rate: Duration,
        identity: ProcessIdentity,
        resolvers: Vec<Resolver>,
        lookup: Arc<dyn ConnectionResolver>,
    ) -> Self {
        let shared = Arc::new(ConnectionShared {
            connections: Snapshot::default(),
            resolvers: Mutex::new(ResolverList::new(resolvers)),
        });

        let task = ConnectionTask {
            shared: Arc::clone(&shared),
            lookup,
            failure_count: 0,
            rate_too_low_count: 0,
        };

        Self {
            daemon: Daemon::new("connections", rate, identity, task),
            shared,
        }
    }

    /// Tracker using the resolvers available on this system.
    pub fn with_system_resolvers(rate: Duration, identity: ProcessIdentity) -> Self {
        Self::new(rate, identity, system_resolvers(), Arc::new(SystemResolver::new()))
    }

    /// Latest connections we retrieved, empty if we've been stopped.
    pub fn get_connections(&self) -> Vec<Connection> {
        if self.daemon.is_halted() {
            Vec::new()
        } else {
            self.shared.connections.load().as_ref().clone()
        }
    }

    /// Resolver the user selected, **None** if we're picking them dynamically
    pub fn get_custom_resolver(&self) -> Option<Resolver> {
        self.shared.resolvers.lock().custom()
    }

    /// Overrides automatic resolver selection, or returns to it with **None**.
    pub fn set_custom_resolver(&self, resolver: Option<Resolver>) {
        self.shared.resolvers.lock().set_custom(resolver);
        info!(?resolver, "Custom connection resolver set");
    }

    /// Resolvers we haven't yet given up on, in priority order
    pub fn resolvers(&self) -> Vec<Resolver> {
        self.shared.resolvers.lock().priority()
    }
}

impl Deref for ConnectionTracker {
    type Target = Daemon;

    fn deref(&self) -> &Daemon {
        &self.daemon
    }
}

struct ConnectionTask {
    shared: Arc<ConnectionShared>,
    lookup: Arc<dyn ConnectionResolver>,
    /// Consecutive failures of our current default resolver
    failure_count: u32,
    /// Consecutive runs whose lookup was too slow for our rate
    rate_too_low_count: u32,
}

impl ConnectionTask {
    fn adjust_rate(&mut self, control: &DaemonControl, runtime: Duration) {
        let min_rate = runtime * RUNTIME_TO_RATE_RATIO;

        if control.rate() >= min_rate {
            self.rate_too_low_count = 0;
            return;
        }

        self.rate_too_low_count += 1;

        if self.rate_too_low_count >= FAILURE_THRESHOLD {
            let new_rate = min_rate + RATE_PADDING;
            control.set_rate(new_rate);
            self.rate_too_low_count = 0;

            debug!(
                rate_secs = new_rate.as_secs_f64(),
                "Connection lookups are slow, increased our rate"
            );
        }
    }

    fn handle_failure(&mut self, resolver: Resolver, err: &LookupError) {
        self.failure_count += 1;

        if self.failure_count < FAILURE_THRESHOLD {
            return;
        }

        self.failure_count = 0;
        let next = self.shared.resolvers.lock().remove_head();

        match next {
            Some(next) => info!(
                tracker = "connections",
                old_resolver = %resolver,
                new_resolver = %next,
                error = %err,
                "Unable to query connections with {}, trying {}",
                resolver,
                next
            ),
            None => warn!(
                tracker = "connections",
                old_resolver = %resolver,
                error = %err,
                "Unable to query connections with any resolver"
            ),
        }
    }
}

impl Task for ConnectionTask {
    fn run(&mut self, control: &DaemonControl, pid: u32, name: &str) -> bool {
        // nothing to resolve with
        let Some(active) = self.shared.resolvers.lock().active() else {
            return false;
        };

        let start = Instant::now();

        match self.lookup.connections(active.resolver, pid, name) {
            Ok(connections) => {
                let runtime = start.elapsed();
                self.shared.connections.store(connections);

                if active.is_default {
                    self.failure_count = 0;
                }

                self.adjust_rate(control, runtime);
                true
            }
            Err(err) => {
                debug!(
                    resolver = %active.resolver,
                    error = %err,
                    parse = err.is_parse(),
                    "Connection lookup failed"
                );

                // a resolver the user picked is retried rather than dropped
                if active.is_default {
                    self.handle_failure(active.resolver, &err);
                }

                false
            }
        }
    }
}
