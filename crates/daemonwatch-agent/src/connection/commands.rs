//! Connection listings from netstat, ss, and lsof

use std::sync::OnceLock;

use daemonwatch_common::{Connection, LookupError, LookupResult, Protocol, Resolver};
use regex::Regex;

use crate::command;

// netstat -np
// tcp        0      0 127.0.0.1:9051          127.0.0.1:37277         ESTABLISHED 2001/tor
fn netstat_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<proto>tcp|udp)6?\s+\d+\s+\d+\s+(?P<local>\S+)\s+(?P<remote>\S+)\s+ESTABLISHED\s+(?P<pid>\d+)/(?P<name>\S*)")
            .expect("valid netstat regex")
    })
}

// ss -nptu
// tcp    ESTAB      0      0   192.168.0.20:44415    38.229.79.2:443    users:(("tor",pid=15843,fd=9))
fn ss_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^(?P<proto>tcp|udp)\s+ESTAB\s+\d+\s+\d+\s+(?P<local>\S+)\s+(?P<remote>\S+)\s+users:\(\("(?P<name>[^"]*)",pid=(?P<pid>\d+),"#)
            .expect("valid ss regex")
    })
}

// lsof -wnPi
// tor     3873  atagar  45u  IPv4  40994      0t0  TCP 10.243.55.20:45724->194.154.227.109:9001 (ESTABLISHED)
fn lsof_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<name>\S+)\s+(?P<pid>\d+)\s+\S+\s+\S+\s+IPv[46]\s+\S+\s+\S+\s+(?P<proto>TCP|UDP)\s+(?P<local>\S+)->(?P<remote>\S+)\s+\(ESTABLISHED\)")
            .expect("valid lsof regex")
    })
}

/// Queries connections with one of the command based resolvers.
pub fn query(resolver: Resolver, pid: u32) -> LookupResult<Vec<Connection>> {
    let (program, args): (&str, &[&str]) = match resolver {
        Resolver::Netstat => ("netstat", &["-np"]),
        Resolver::Ss => ("ss", &["-nptu"]),
        Resolver::Lsof => ("lsof", &["-wnPi"]),
        Resolver::Proc => {
            return Err(LookupError::Unavailable(
                "proc isn't a command based resolver".to_string(),
            ))
        }
    };

    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    let lines = command::call(program, &args)?;

    if lines.is_empty() {
        return Err(LookupError::command(
            command::command_line(program, &args),
            "no output",
        ));
    }

    parse(resolver, &lines, pid)
}

/// Parses a resolver's output, keeping established connections of `pid`.
pub fn parse(resolver: Resolver, lines: &[String], pid: u32) -> LookupResult<Vec<Connection>> {
    let regex = match resolver {
        Resolver::Netstat => netstat_regex(),
        Resolver::Ss => ss_regex(),
        Resolver::Lsof => lsof_regex(),
        Resolver::Proc => return Ok(Vec::new()),
    };

    let mut connections = Vec::new();

    for line in lines {
        let Some(caps) = regex.captures(line) else {
            continue;
        };

        let line_pid: u32 = caps["pid"]
            .parse()
            .map_err(|_| LookupError::parse(resolver.name(), format!("invalid pid: {}", line)))?;

        if line_pid != pid {
            continue;
        }

        let protocol = if caps["proto"].eq_ignore_ascii_case("udp") {
            Protocol::Udp
        } else {
            Protocol::Tcp
        };

        let invalid_address =
            || LookupError::parse(resolver.name(), format!("invalid address: {}", line));

        let (local_address, local_port) =
            split_address(&caps["local"]).ok_or_else(invalid_address)?;
        let (remote_address, remote_port) =
            split_address(&caps["remote"]).ok_or_else(invalid_address)?;

        connections.push(Connection::new(
            local_address,
            local_port,
            remote_address,
            remote_port,
            protocol,
        ));
    }

    Ok(connections)
}

/// Splits an `address:port` entry. IPv6 addresses may be bracketed.
pub fn split_address(entry: &str) -> Option<(String, u16)> {
    let (address, port) = entry.rsplit_once(':')?;
    let address = address.trim_start_matches('[').trim_end_matches(']');
    let port: u16 = port.parse().ok()?;

    if address.is_empty() || port == 0 {
        return None;
    }

    Some((address.to_string(), port))
}
