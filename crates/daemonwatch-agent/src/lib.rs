//! daemonwatch agent
//!
//! Background trackers reporting on a single monitored process: the
//! connections it has established, its resource usage, and which local
//! applications are using its ports.

pub mod command;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod identity;
pub mod ports;
pub mod resources;
pub mod trackers;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use connection::ConnectionTracker;
pub use daemon::{Daemon, DaemonControl, DaemonState, Task};
pub use identity::ProcessWatcher;
pub use ports::PortUsageTracker;
pub use resources::ResourceTracker;
pub use trackers::Trackers;
