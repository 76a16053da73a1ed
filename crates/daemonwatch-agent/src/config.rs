//! Agent configuration
//!
//! Read from `config.toml` in the platform's config directory when present,
//! then overridden by `DAEMONWATCH_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use daemonwatch_common::{ProcessIdentity, Resolver};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Configuration for the trackers and the binary driving them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection resolver to use rather than picking one ourselves
    pub resolver: Option<Resolver>,
    /// Log level for our own crate when RUST_LOG isn't set
    pub log_level: String,
    pub process: ProcessConfig,
    pub rates: RateConfig,
    pub display: DisplayConfig,
}

/// Process we track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Name to look the process up by, and to fall back on when a status
    /// update lacks one
    pub name: String,
    /// Tracks this pid rather than searching by name
    pub pid: Option<u32>,
}

/// Seconds between each tracker's runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    pub connections: f64,
    pub resources: f64,
    pub port_usage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Milliseconds between status lines
    pub refresh_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resolver: None,
            log_level: "info".to_string(),
            process: ProcessConfig::default(),
            rates: RateConfig::default(),
            display: DisplayConfig::default(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            name: "tor".to_string(),
            pid: None,
        }
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            connections: 5.0,
            resources: 5.0,
            port_usage: 5.0,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self { refresh_ms: 1000 }
    }
}

impl Config {
    /// Location of our config file, if this platform has a config directory
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "daemonwatch", "daemonwatch")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Loads our config file if there is one, then applies environment
    /// overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        Self::from_toml(&contents).with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `DAEMONWATCH_*` overrides, reading variables through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(name) = lookup("DAEMONWATCH_PROCESS_NAME") {
            self.process.name = name;
        }

        if let Some(pid) = lookup("DAEMONWATCH_PID") {
            self.process.pid = Some(
                pid.trim()
                    .parse()
                    .with_context(|| format!("DAEMONWATCH_PID isn't a pid: {}", pid))?,
            );
        }

        if let Some(resolver) = lookup("DAEMONWATCH_RESOLVER") {
            self.resolver = Some(resolver.parse().context("Invalid DAEMONWATCH_RESOLVER")?);
        }

        for (key, rate) in [
            ("DAEMONWATCH_CONNECTION_RATE", &mut self.rates.connections),
            ("DAEMONWATCH_RESOURCE_RATE", &mut self.rates.resources),
            ("DAEMONWATCH_PORT_USAGE_RATE", &mut self.rates.port_usage),
        ] {
            if let Some(value) = lookup(key) {
                *rate = value
                    .trim()
                    .parse()
                    .with_context(|| format!("{} isn't a number of seconds: {}", key, value))?;
            }
        }

        if let Some(level) = lookup("DAEMONWATCH_LOG_LEVEL") {
            self.log_level = level;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("connections", self.rates.connections),
            ("resources", self.rates.resources),
            ("port_usage", self.rates.port_usage),
        ] {
            if !rate.is_finite() || rate <= 0.0 {
                bail!("rates.{} must be a positive number of seconds, got {}", name, rate);
            }

            if Duration::try_from_secs_f64(rate).is_err() {
                bail!("rates.{} is too long, got {} seconds", name, rate);
            }
        }

        if self.process.name.trim().is_empty() {
            bail!("process.name can't be empty");
        }

        Ok(())
    }

    /// Identity our trackers begin with
    pub fn identity(&self) -> ProcessIdentity {
        ProcessIdentity::new(self.process.pid, self.process.name.clone())
    }

    pub fn connection_rate(&self) -> Duration {
        Duration::from_secs_f64(self.rates.connections)
    }

    pub fn resource_rate(&self) -> Duration {
        Duration::from_secs_f64(self.rates.resources)
    }

    pub fn port_usage_rate(&self) -> Duration {
        Duration::from_secs_f64(self.rates.port_usage)
    }

    pub fn display_refresh(&self) -> Duration {
        Duration::from_millis(self.display.refresh_ms.max(1))
    }
}
