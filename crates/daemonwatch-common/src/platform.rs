//! Lookup abstractions the trackers are built on
//!
//! Each tracker queries the operating system through one of these traits so
//! the concrete mechanism (a /proc reader, an external command) can be swapped
//! out, and so the trackers can be exercised against scripted lookups.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::{Connection, ResourceSample};
use crate::resolver::Resolver;

/// Errors from a single OS lookup
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("{command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("unable to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unrecognized output from {source_name}: {detail}")]
    Parse { source_name: String, detail: String },

    #[error("lookup unavailable: {0}")]
    Unavailable(String),
}

impl LookupError {
    pub fn command(command: impl Into<String>, reason: impl fmt::Display) -> Self {
        LookupError::Command {
            command: command.into(),
            reason: reason.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LookupError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(source_name: impl Into<String>, detail: impl fmt::Display) -> Self {
        LookupError::Parse {
            source_name: source_name.into(),
            detail: detail.to_string(),
        }
    }

    pub fn is_parse(&self) -> bool {
        matches!(self, LookupError::Parse { .. })
    }
}

/// Result type for OS lookups
pub type LookupResult<T> = Result<T, LookupError>;

/// Lists the connections a process has established
pub trait ConnectionResolver: Send + Sync {
    fn connections(
        &self,
        resolver: Resolver,
        pid: u32,
        name: &str,
    ) -> LookupResult<Vec<Connection>>;
}

/// Mechanism used to sample resource usage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceBackend {
    /// Structured stat files under /proc
    Proc,
    /// The `ps` command
    Ps,
}

impl ResourceBackend {
    pub fn name(&self) -> &'static str {
        match self {
            ResourceBackend::Proc => "proc",
            ResourceBackend::Ps => "ps",
        }
    }
}

impl fmt::Display for ResourceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Samples the CPU and memory usage of a process
pub trait ResourceSource: Send + Sync {
    fn sample(&self, backend: ResourceBackend, pid: u32) -> LookupResult<ResourceSample>;
}

/// Determines which process owns each of a set of ports
pub trait PortLookup: Send + Sync {
    /// Provides `port => process name` for the ports that could be attributed.
    /// Ports nobody is using are simply absent.
    fn processes_for_ports(&self, ports: &[u16]) -> LookupResult<HashMap<u16, String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = LookupError::command("lsof -nP", "exit status 2");
        assert_eq!(err.to_string(), "lsof -nP failed: exit status 2");

        let err = LookupError::parse("ps", "expected four fields");
        assert!(err.is_parse());
        assert_eq!(err.to_string(), "unrecognized output from ps: expected four fields");

        let err = LookupError::io(
            "/proc/1/stat",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(!err.is_parse());
        assert_eq!(err.to_string(), "unable to read /proc/1/stat: gone");
    }
}
