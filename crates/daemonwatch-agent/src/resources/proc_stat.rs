//! Resource usage from /proc stat files

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use daemonwatch_common::{LookupError, LookupResult, ResourceSample};

/// Fields of /proc/<pid>/stat, counted from the one after the command name
const UTIME_FIELD: usize = 11;
const STIME_FIELD: usize = 12;
const START_TIME_FIELD: usize = 19;

/// Reads resource usage out of a proc filesystem
pub struct ProcStat {
    root: PathBuf,
    clock_ticks: f64,
}

impl ProcStat {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            clock_ticks: clock_ticks(),
        }
    }

    /// Uses a fixed number of clock ticks per second rather than asking the
    /// system.
    pub fn with_clock_ticks(mut self, clock_ticks: f64) -> Self {
        self.clock_ticks = clock_ticks;
        self
    }

    pub fn is_available(&self) -> bool {
        self.root.join("stat").is_file() && self.root.join("meminfo").is_file()
    }

    pub fn sample(&self, pid: u32) -> LookupResult<ResourceSample> {
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        self.sample_at(pid, now)
    }

    /// Samples a process as of the given unix time.
    pub fn sample_at(&self, pid: u32, now: f64) -> LookupResult<ResourceSample> {
        let process_dir = self.root.join(pid.to_string());

        let stat_path = process_dir.join("stat");
        let stat = read(&stat_path)?;
        let fields = stat_fields(&stat).ok_or_else(|| {
            LookupError::parse(stat_path.display().to_string(), "missing command name")
        })?;

        let utime = stat_value(&fields, UTIME_FIELD, &stat_path)?;
        let stime = stat_value(&fields, STIME_FIELD, &stat_path)?;
        let start_ticks = stat_value(&fields, START_TIME_FIELD, &stat_path)?;

        let boot_time = self.boot_time()?;
        let total_cpu_time = (utime + stime) / self.clock_ticks;
        let start_time = boot_time + start_ticks / self.clock_ticks;

        let memory_bytes = kilobyte_entry(&process_dir.join("status"), "VmRSS:")?;
        let total_memory = kilobyte_entry(&self.root.join("meminfo"), "MemTotal:")?;

        let memory_percent = if total_memory > 0 {
            memory_bytes as f64 / total_memory as f64
        } else {
            0.0
        };

        Ok(ResourceSample {
            total_cpu_time,
            uptime: (now - start_time).max(0.0),
            memory_bytes,
            memory_percent,
        })
    }

    /// Unix time the system booted at
    fn boot_time(&self) -> LookupResult<f64> {
        let path = self.root.join("stat");
        let content = read(&path)?;

        content
            .lines()
            .find_map(|line| line.strip_prefix("btime "))
            .and_then(|value| value.trim().parse::<f64>().ok())
            .ok_or_else(|| LookupError::parse(path.display().to_string(), "no btime entry"))
    }
}

fn read(path: &Path) -> LookupResult<String> {
    fs::read_to_string(path).map_err(|e| LookupError::io(path, e))
}

/// Splits a stat line after the command name, which can contain spaces and
/// parentheses of its own
fn stat_fields(stat: &str) -> Option<Vec<&str>> {
    let (_, rest) = stat.rsplit_once(')')?;
    Some(rest.split_whitespace().collect())
}

fn stat_value(fields: &[&str], index: usize, path: &Path) -> LookupResult<f64> {
    fields
        .get(index)
        .and_then(|value| value.parse::<f64>().ok())
        .ok_or_else(|| {
            LookupError::parse(
                path.display().to_string(),
                format!("field {} is missing or malformed", index + 3),
            )
        })
}

/// Value in bytes of a `Key:   1234 kB` entry
fn kilobyte_entry(path: &Path, key: &str) -> LookupResult<u64> {
    let content = read(path)?;

    content
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|value| value.split_whitespace().next())
        .and_then(|value| value.parse::<u64>().ok())
        .and_then(|kb| kb.checked_mul(1024))
        .ok_or_else(|| {
            LookupError::parse(
                path.display().to_string(),
                format!("{} entry is missing or out of range", key),
            )
        })
}

#[cfg(unix)]
fn clock_ticks() -> f64 {
    // SAFETY: sysconf has no preconditions
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };

    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

#[cfg(not(unix))]
fn clock_ticks() -> f64 {
    100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const PID_STAT: &str = "4321 (tor (relay)) S 1 4321 4321 0 -1 4194560 23425 0 2 0 1250 750 0 0 20 0 3 0 500000 212221952 18772 18446744073709551615 1 1 0 0 0 0 0 4096 25155 0 0 0 17 1 0 0 0 0 0";

    const PID_STATUS: &str = "\
Name:\ttor
State:\tS (sleeping)
VmPeak:\t  212224 kB
VmRSS:\t   18772 kB
Threads:\t3
";

    fn fake_proc() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("4321")).unwrap();
        fs::write(root.path().join("4321/stat"), PID_STAT).unwrap();
        fs::write(root.path().join("4321/status"), PID_STATUS).unwrap();
        fs::write(
            root.path().join("stat"),
            "cpu  1 2 3 4\nctxt 9999\nbtime 1700000000\nprocesses 12\n",
        )
        .unwrap();
        fs::write(
            root.path().join("meminfo"),
            "MemTotal:        1877200 kB\nMemFree:          100000 kB\n",
        )
        .unwrap();
        root
    }

    #[test]
    fn test_sample_from_fake_proc() {
        let root = fake_proc();
        let proc_stat = ProcStat::new(root.path()).with_clock_ticks(100.0);
        assert!(proc_stat.is_available());

        // started 5000s after boot, sampled 1000s later
        let sample = proc_stat.sample_at(4321, 1_700_006_000.0).unwrap();

        assert_eq!(sample.total_cpu_time, 20.0);
        assert_eq!(sample.uptime, 1000.0);
        assert_eq!(sample.memory_bytes, 18772 * 1024);
        assert!((sample.memory_percent - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_missing_process_is_an_io_error() {
        let root = fake_proc();
        let proc_stat = ProcStat::new(root.path());

        assert!(matches!(proc_stat.sample(1), Err(LookupError::Io { .. })));
    }

    #[test]
    fn test_truncated_stat_is_a_parse_error() {
        let root = fake_proc();
        fs::write(root.path().join("4321/stat"), "4321 (tor) S 1 4321").unwrap();

        let err = ProcStat::new(root.path()).sample(4321).unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn test_missing_rss_is_a_parse_error() {
        let root = fake_proc();
        fs::write(root.path().join("4321/status"), "Name:\tkthreadd\n").unwrap();

        let err = ProcStat::new(root.path()).sample(4321).unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn test_oversized_rss_is_a_parse_error() {
        let root = fake_proc();
        fs::write(root.path().join("4321/status"), "VmRSS:\t99999999999999999 kB\n").unwrap();

        let err = ProcStat::new(root.path()).sample(4321).unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn test_stat_fields_skip_command_name() {
        let fields = stat_fields(PID_STAT).unwrap();
        assert_eq!(fields[0], "S");
        assert_eq!(fields[UTIME_FIELD], "1250");
        assert_eq!(fields[STIME_FIELD], "750");
        assert_eq!(fields[START_TIME_FIELD], "500000");
        assert!(stat_fields("no command").is_none());
    }
}
