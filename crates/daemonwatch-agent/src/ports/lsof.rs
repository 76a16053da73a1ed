//! Port ownership lookups through lsof

use std::collections::HashMap;

use daemonwatch_common::{LookupError, LookupResult, PortLookup};

use crate::command;
use crate::connection::split_address;

const ESTABLISHED: &str = "(ESTABLISHED)";

/// Attributes ports to processes by asking lsof about them
#[derive(Debug, Default)]
pub struct LsofPortLookup;

impl LsofPortLookup {
    pub fn new() -> Self {
        Self
    }
}

impl PortLookup for LsofPortLookup {
    fn processes_for_ports(&self, ports: &[u16]) -> LookupResult<HashMap<u16, String>> {
        if ports.is_empty() {
            return Ok(HashMap::new());
        }

        let mut args = vec!["-nP".to_string()];

        for port in ports {
            args.push("-i".to_string());
            args.push(format!("tcp:{}", port));
        }

        let lines = command::call("lsof", &args)?;
        parse_output(&lines, ports)
    }
}

/// Parses lsof output of the form...
///
/// ```text
/// COMMAND  PID   USER   FD   TYPE DEVICE SIZE/OFF NODE NAME
/// tor     2001 atagar   14u  IPv4  14048      0t0  TCP 127.0.0.1:9051->127.0.0.1:37277 (ESTABLISHED)
/// python  2462 atagar    3u  IPv4  14047      0t0  TCP 127.0.0.1:37277->127.0.0.1:9051 (ESTABLISHED)
/// ```
///
/// Each row maps its local port if that's one we're after, and its remote
/// port otherwise. A single malformed row fails the whole lookup.
pub fn parse_output(lines: &[String], ports: &[u16]) -> LookupResult<HashMap<u16, String>> {
    let mut results = HashMap::new();

    let rows = match lines.first() {
        Some(first) if first.split_whitespace().next() == Some("COMMAND") => &lines[1..],
        _ => lines,
    };

    for line in rows {
        let Some((local_port, remote_port, command)) = parse_line(line)
            .map_err(|detail| LookupError::parse("lsof", format!("{}: {}", detail, line)))?
        else {
            continue;
        };

        if ports.contains(&local_port) {
            results.insert(local_port, command);
        } else if ports.contains(&remote_port) {
            results.insert(remote_port, command);
        }
    }

    Ok(results)
}

/// Provides the (local port, remote port, command) of an established row,
/// or **None** if the row should be skipped.
fn parse_line(line: &str) -> Result<Option<(u16, u16, String)>, String> {
    let fields: Vec<&str> = line.split_whitespace().collect();

    if fields.is_empty() {
        return Ok(None);
    }

    if fields.len() != 10 {
        return Err("lines are expected to have ten fields".to_string());
    }

    if fields[9] != ESTABLISHED {
        return Ok(None);
    }

    let port_map = fields[8];
    let (local, remote) = port_map
        .split_once("->")
        .ok_or_else(|| format!("'{}' is expected to be a '->' separated mapping", port_map))?;

    let (_, local_port) = split_address(local)
        .ok_or_else(|| format!("'{}' isn't a valid address:port", local))?;
    let (_, remote_port) = split_address(remote)
        .ok_or_else(|| format!("'{}' isn't a valid address:port", remote))?;

    Ok(Some((local_port, remote_port, fields[0].to_string())))
}
