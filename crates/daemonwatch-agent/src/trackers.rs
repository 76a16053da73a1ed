//! The set of trackers a monitor runs

use std::io;
use std::sync::Arc;

use daemonwatch_common::StatusEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::ConnectionTracker;
use crate::daemon::Daemon;
use crate::ports::PortUsageTracker;
use crate::resources::ResourceTracker;

/// Connection, resource, and port usage trackers for a single process
pub struct Trackers {
    pub connections: ConnectionTracker,
    pub resources: ResourceTracker,
    pub port_usage: PortUsageTracker,
}

impl Trackers {
    /// Trackers using this system's lookups, configured but not yet started.
    pub fn new(config: &Config) -> Self {
        let identity = config.identity();

        let connections =
            ConnectionTracker::with_system_resolvers(config.connection_rate(), identity.clone());

        if let Some(resolver) = config.resolver {
            connections.set_custom_resolver(Some(resolver));
        }

        Self {
            connections,
            resources: ResourceTracker::with_system_source(
                config.resource_rate(),
                identity.clone(),
            ),
            port_usage: PortUsageTracker::with_lsof(config.port_usage_rate(), identity),
        }
    }

    fn daemons(&self) -> [&Daemon; 3] {
        [&self.connections, &self.resources, &self.port_usage]
    }

    pub fn start_all(&self) -> io::Result<()> {
        for daemon in self.daemons() {
            daemon.start()?;
        }

        info!("Trackers started");
        Ok(())
    }

    /// Delivers a process identity update to every tracker.
    pub fn handle_status(&self, event: &StatusEvent) {
        for daemon in self.daemons() {
            daemon.handle_status(event);
        }
    }

    /// Delivers status events from the process watcher until it goes away.
    ///
    /// Trackers hold their identity while a run is in progress, so each
    /// update is applied on the blocking pool, one at a time and in order.
    pub async fn forward_status(self: Arc<Self>, mut events: broadcast::Receiver<StatusEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let trackers = Arc::clone(&self);
                    let applied =
                        tokio::task::spawn_blocking(move || trackers.handle_status(&event)).await;

                    if let Err(err) = applied {
                        warn!(error = %err, "Unable to apply process status update");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed process status updates");
                }
                Err(RecvError::Closed) => {
                    debug!("Process status feed closed");
                    break;
                }
            }
        }
    }

    /// Halts every tracker, then waits for them all to finish.
    pub fn stop_all(&self) {
        for daemon in self.daemons() {
            daemon.stop();
        }

        for daemon in self.daemons() {
            daemon.join();
        }

        info!("Trackers stopped");
    }
}
