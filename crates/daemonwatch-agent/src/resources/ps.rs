//! Resource usage from the `ps` command

use std::sync::OnceLock;

use daemonwatch_common::{LookupError, LookupResult, ResourceSample};
use regex::Regex;

use crate::command;

const PS_FIELDS: &str = "cputime,etime,rss,%mem";

/// `[[dd-]hh:]mm:ss[.ff]`
fn time_label_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:(?:(\d+)-)?(\d+):)?(\d+):(\d+(?:\.\d+)?)$").expect("valid regex")
    })
}

/// Samples a process through ps.
pub fn sample(pid: u32) -> LookupResult<ResourceSample> {
    let args = vec![
        "-p".to_string(),
        pid.to_string(),
        "-o".to_string(),
        PS_FIELDS.to_string(),
    ];

    let lines = command::call("ps", &args)?;
    parse_output(&lines)
}

/// Parses output of the form...
///
/// ```text
///     TIME     ELAPSED    RSS %MEM
/// 00:00:03    05:12:48  18772  1.0
/// ```
pub fn parse_output(lines: &[String]) -> LookupResult<ResourceSample> {
    // ps only prints its header when the process is gone
    let Some(stats_line) = lines.iter().skip(1).find(|line| !line.trim().is_empty()) else {
        return Err(LookupError::parse("ps", "no stats for the process"));
    };

    let stats: Vec<&str> = stats_line.split_whitespace().collect();

    if stats.len() != 4 {
        return Err(LookupError::parse(
            "ps",
            format!("expected four fields but got: {}", stats_line.trim()),
        ));
    }

    let total_cpu_time = parse_time_label(stats[0])
        .ok_or_else(|| LookupError::parse("ps", format!("invalid cpu time: {}", stats[0])))?;
    let uptime = parse_time_label(stats[1])
        .ok_or_else(|| LookupError::parse("ps", format!("invalid elapsed time: {}", stats[1])))?;
    let rss_kb: u64 = stats[2]
        .parse()
        .map_err(|_| LookupError::parse("ps", format!("invalid rss: {}", stats[2])))?;
    let memory_bytes = rss_kb
        .checked_mul(1024)
        .ok_or_else(|| LookupError::parse("ps", format!("rss out of range: {}", stats[2])))?;
    let memory_percent: f64 = stats[3]
        .parse()
        .map_err(|_| LookupError::parse("ps", format!("invalid memory percent: {}", stats[3])))?;

    Ok(ResourceSample {
        total_cpu_time,
        uptime,
        memory_bytes,
        memory_percent: memory_percent / 100.0,
    })
}

/// Seconds represented by a ps time label such as `3-08:06:32` or `04:40.15`
pub fn parse_time_label(label: &str) -> Option<f64> {
    let caps = time_label_regex().captures(label.trim())?;

    let number = |index: usize| -> Option<f64> {
        match caps.get(index) {
            Some(m) => m.as_str().parse().ok(),
            None => Some(0.0),
        }
    };

    let days = number(1)?;
    let hours = number(2)?;
    let minutes = number(3)?;
    let seconds = number(4)?;

    Some(days * 86_400.0 + hours * 3_600.0 + minutes * 60.0 + seconds)
}
