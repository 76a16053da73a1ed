//! Linux /proc/net based connection lookups
//!
//! Parses /proc/net/tcp, tcp6, udp, and udp6, keeping entries whose socket
//! inode belongs to the tracked process.

use std::collections::HashSet;
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use daemonwatch_common::{Connection, LookupError, LookupResult, Protocol};

/// TCP_ESTABLISHED in the kernel's socket state table
const TCP_ESTABLISHED: &str = "01";

/// Connection reader over a proc filesystem
pub struct ProcNet {
    root: PathBuf,
}

impl ProcNet {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Checks that the files we read from exist.
    pub fn is_available(&self) -> bool {
        self.root.join("net/tcp").is_file()
    }

    /// Provides the established connections of a process.
    pub fn connections(&self, pid: u32) -> LookupResult<Vec<Connection>> {
        let inodes = self.socket_inodes(pid)?;

        if inodes.is_empty() {
            return Ok(Vec::new());
        }

        let mut connections = Vec::new();

        for (file, protocol, ipv6) in [
            ("net/tcp", Protocol::Tcp, false),
            ("net/tcp6", Protocol::Tcp, true),
            ("net/udp", Protocol::Udp, false),
            ("net/udp6", Protocol::Udp, true),
        ] {
            let path = self.root.join(file);

            // tcp6/udp6 are absent when ipv6 is disabled
            if !path.exists() {
                continue;
            }

            let content = fs::read_to_string(&path).map_err(|e| LookupError::io(&path, e))?;
            connections.extend(parse_socket_table(&content, protocol, ipv6, &inodes, &path)?);
        }

        Ok(connections)
    }

    /// Socket inodes held open by a process, from the `socket:[12345]` links
    /// under /proc/<pid>/fd
    fn socket_inodes(&self, pid: u32) -> LookupResult<HashSet<u64>> {
        let fd_path = self.root.join(pid.to_string()).join("fd");
        let fd_dir = fs::read_dir(&fd_path).map_err(|e| LookupError::io(&fd_path, e))?;

        let mut inodes = HashSet::new();

        for fd_entry in fd_dir.flatten() {
            // descriptors can close while we're iterating
            let Ok(link) = fs::read_link(fd_entry.path()) else {
                continue;
            };

            let link_str = link.to_string_lossy();

            if let Some(inode) = link_str
                .strip_prefix("socket:[")
                .and_then(|s| s.strip_suffix(']'))
                .and_then(|s| s.parse::<u64>().ok())
            {
                inodes.insert(inode);
            }
        }

        Ok(inodes)
    }
}

fn parse_socket_table(
    content: &str,
    protocol: Protocol,
    ipv6: bool,
    inodes: &HashSet<u64>,
    path: &Path,
) -> LookupResult<Vec<Connection>> {
    let mut connections = Vec::new();
    let source = path.display().to_string();

    // first line is a header
    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();

        if parts.len() < 10 {
            continue;
        }

        let inode: u64 = match parts[9].parse() {
            Ok(inode) => inode,
            Err(_) => continue,
        };

        if !inodes.contains(&inode) {
            continue;
        }

        if protocol == Protocol::Tcp && parts[3] != TCP_ESTABLISHED {
            continue;
        }

        let parse_addr = if ipv6 { parse_ipv6_addr } else { parse_ipv4_addr };

        let (local_address, local_port) = parse_addr(parts[1]).ok_or_else(|| {
            LookupError::parse(&source, format!("invalid local address: {}", parts[1]))
        })?;
        let (remote_address, remote_port) = parse_addr(parts[2]).ok_or_else(|| {
            LookupError::parse(&source, format!("invalid remote address: {}", parts[2]))
        })?;

        // unconnected udp sockets
        if remote_port == 0 {
            continue;
        }

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

/// Parse IPv4 address in hex format (e.g., "0100007F:0050")
fn parse_ipv4_addr(addr: &str) -> Option<(String, u16)> {
    let (ip_hex, port_hex) = addr.split_once(':')?;

    if ip_hex.len() != 8 {
        return None;
    }

    // stored in host byte order, which is little-endian on the platforms we run on
    let raw = u32::from_str_radix(ip_hex, 16).ok()?;
    let ip = Ipv4Addr::from(raw.to_le_bytes());
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    Some((ip.to_string(), port))
}

/// Parse IPv6 address in hex format (32 hex chars, four host order words)
fn parse_ipv6_addr(addr: &str) -> Option<(String, u16)> {
    let (ip_hex, port_hex) = addr.split_once(':')?;

    if ip_hex.len() != 32 {
        return None;
    }

    let mut bytes = [0u8; 16];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(ip_hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
    }

    for chunk in bytes.chunks_exact_mut(4) {
        chunk.reverse();
    }

    let port = u16::from_str_radix(port_hex, 16).ok()?;

    Some((Ipv6Addr::from(bytes).to_string(), port))
}
