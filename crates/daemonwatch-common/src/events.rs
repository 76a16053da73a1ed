//! Event and snapshot types shared by the trackers and their consumers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle event kinds delivered by the process identity feed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusEventType {
    /// Monitored process became known
    Init,
    /// Monitored process was restarted or changed identity
    Reset,
    /// Monitored process went away
    Stopped,
}

/// A process identity update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub event_type: StatusEventType,
    /// Operating system PID, absent if the process couldn't be found
    pub pid: Option<u32>,
    /// Process name, absent if it couldn't be determined
    pub name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(event_type: StatusEventType, pid: Option<u32>, name: Option<String>) -> Self {
        Self {
            event_type,
            pid,
            name,
            timestamp: Utc::now(),
        }
    }

    pub fn init(pid: Option<u32>, name: Option<String>) -> Self {
        Self::new(StatusEventType::Init, pid, name)
    }

    pub fn reset(pid: Option<u32>, name: Option<String>) -> Self {
        Self::new(StatusEventType::Reset, pid, name)
    }

    pub fn stopped() -> Self {
        Self::new(StatusEventType::Stopped, None, None)
    }
}

/// The process currently being tracked
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: Option<u32>,
    pub name: String,
}

impl ProcessIdentity {
    pub fn new(pid: Option<u32>, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
        }
    }
}

/// Network protocol type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An established connection of the tracked process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Connection {
    pub local_address: String,
    pub local_port: u16,
    pub remote_address: String,
    pub remote_port: u16,
    pub protocol: Protocol,
}

impl Connection {
    pub fn new(
        local_address: impl Into<String>,
        local_port: u16,
        remote_address: impl Into<String>,
        remote_port: u16,
        protocol: Protocol,
    ) -> Self {
        Self {
            local_address: local_address.into(),
            local_port,
            remote_address: remote_address.into(),
            remote_port,
            protocol,
        }
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} ({})",
            self.local_address,
            self.local_port,
            self.remote_address,
            self.remote_port,
            self.protocol
        )
    }
}

/// Raw figures produced by a resource backend for a single lookup
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    /// Cumulative user and system CPU time in seconds
    pub total_cpu_time: f64,
    /// Seconds since the process started
    pub uptime: f64,
    /// Resident memory in bytes
    pub memory_bytes: u64,
    /// Fraction of physical memory in use by the process
    pub memory_percent: f64,
}

/// Resource usage of the tracked process
///
/// The default value is all zeros with a timestamp at the unix epoch, which is
/// what consumers see before the first sample lands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// Change in total CPU time relative to the previous sample
    pub cpu_sample: f64,
    /// Total CPU time divided by uptime
    pub cpu_average: f64,
    /// Total CPU time the process has used, in seconds
    pub cpu_total: f64,
    pub memory_bytes: u64,
    pub memory_percent: f64,
    pub timestamp: DateTime<Utc>,
}

impl Resources {
    /// Build the next snapshot from a raw sample and the snapshot before it.
    pub fn from_sample(sample: ResourceSample, previous: Option<&Resources>) -> Self {
        let cpu_sample = match previous {
            Some(prev) if prev.cpu_total > 0.0 => {
                (sample.total_cpu_time - prev.cpu_total) / prev.cpu_total
            }
            _ => 0.0,
        };

        let cpu_average = if sample.uptime > 0.0 {
            sample.total_cpu_time / sample.uptime
        } else {
            0.0
        };

        Self {
            cpu_sample,
            cpu_average,
            cpu_total: sample.total_cpu_time,
            memory_bytes: sample.memory_bytes,
            memory_percent: sample.memory_percent,
            timestamp: Utc::now(),
        }
    }
}
