//! daemonwatch - process connection and resource monitor
//!
//! Tracks a single process (tor by default), periodically printing its
//! resource usage, its connections, and the local applications talking to it.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use daemonwatch_agent::{Config, ProcessWatcher, Trackers};
use daemonwatch_common::Connection;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("daemonwatch_agent={}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting daemonwatch");
    tracing::info!("Platform: {}", std::env::consts::OS);
    tracing::info!(process = %config.process.name, pid = ?config.process.pid, "Tracking process");

    let trackers = Arc::new(Trackers::new(&config));
    trackers.start_all().context("Failed to start trackers")?;

    let watcher = ProcessWatcher::new(config.process.name.clone(), config.process.pid);
    let status_rx = watcher.subscribe();
    let watcher_task = watcher.spawn(config.display_refresh());
    let mut forwarder = tokio::spawn(Arc::clone(&trackers).forward_status(status_rx));

    let mut refresh = tokio::time::interval(config.display_refresh());
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Received interrupt, shutting down");
                break;
            }
            _ = &mut forwarder => {
                tracing::warn!("Process watcher exited");
                break;
            }
            _ = refresh.tick() => print_status(&trackers),
        }
    }

    forwarder.abort();
    watcher_task.abort();

    tokio::task::spawn_blocking(move || trackers.stop_all())
        .await
        .context("Failed to stop trackers")?;

    Ok(())
}

/// Writes a summary of what the trackers last reported.
fn print_status(trackers: &Trackers) {
    let resources = trackers.resources.get_resource_usage();
    let connections = trackers.connections.get_connections();

    // ask who is on the other end of local connections
    let local_ports: Vec<u16> = connections
        .iter()
        .filter(|conn| is_loopback(&conn.remote_address))
        .map(|conn| conn.remote_port)
        .collect();

    let applications = trackers.port_usage.get_processes_using_ports(&local_ports);

    println!(
        "cpu: {:.1}% (avg {:.1}%)  memory: {} ({:.1}%)  connections: {}",
        resources.cpu_sample * 100.0,
        resources.cpu_average * 100.0,
        format_bytes(resources.memory_bytes),
        resources.memory_percent * 100.0,
        connections.len()
    );

    for conn in &connections {
        println!("  {}{}", conn, application_label(conn, &applications));
    }
}

fn is_loopback(address: &str) -> bool {
    address
        .parse::<std::net::IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

fn application_label(conn: &Connection, applications: &HashMap<u16, String>) -> String {
    match applications.get(&conn.remote_port) {
        Some(process) if is_loopback(&conn.remote_address) => format!("  [{}]", process),
        _ => String::new(),
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    let mut value = bytes as f64;
    let mut unit = 0;

    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{:.1} {}", value, UNITS[unit])
}
