//! `status` command

use chrono::{DateTime, Local, Utc};
use colored::{ColoredString, Colorize};

use tunwarden_core::error::{DaemonError, TunwardenError};
use tunwarden_core::types::{ConnectionStatus, TunnelState};

use super::client;
use crate::daemon::ipc::{StatusReport, TunnelSummary};

pub(crate) fn colored_state(state: TunnelState) -> ColoredString {
    match state {
        TunnelState::Up => "up".green().bold(),
        TunnelState::Down => "down".dimmed(),
    }
}

fn colored_status(status: ConnectionStatus) -> ColoredString {
    match status {
        ConnectionStatus::Connected => "connected".green(),
        ConnectionStatus::Connecting => "connecting".yellow(),
        ConnectionStatus::Disconnected => "disconnected".dimmed(),
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{:.1} {}", value, unit)
}

fn format_handshake(epoch_millis: Option<u64>) -> String {
    epoch_millis
        .and_then(|ms| i64::try_from(ms).ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|at| {
            at.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| "never".to_string())
}

fn tunnel_line(tunnel: &TunnelSummary, last_used: Option<&str>) -> String {
    let marker = if last_used == Some(tunnel.name.as_str()) {
        "*"
    } else {
        " "
    };
    let mut line = format!(
        "{} {:<16} {:<5} {}",
        marker,
        tunnel.name,
        colored_state(tunnel.state),
        colored_status(tunnel.status)
    );
    if tunnel.state == TunnelState::Up {
        line.push_str(&format!(
            "  rx {}  tx {}  handshake {}",
            format_bytes(tunnel.rx_bytes),
            format_bytes(tunnel.tx_bytes),
            format_handshake(tunnel.latest_handshake_epoch_millis)
        ));
    }
    line
}

fn print_report(report: &StatusReport) {
    println!("{} tunwarden daemon (PID {})", "●".green(), report.pid);
    println!(
        "Backend: {}",
        report.backend.as_deref().unwrap_or("selecting...")
    );

    let network = &report.network;
    let network_line = if !report.monitor_bound {
        "not monitored".yellow()
    } else if network.is_connected() {
        format!("{} (validated)", network.transport).green()
    } else {
        network.transport.to_string().normal()
    };
    println!("Network: {}", network_line);

    if report.tunnels.is_empty() {
        println!("No tunnels configured");
        return;
    }
    println!("Tunnels:");
    for tunnel in &report.tunnels {
        println!("{}", tunnel_line(tunnel, report.last_used_tunnel.as_deref()));
    }
}

/// Show daemon and tunnel status
pub fn run_status(json: bool) -> Result<(), TunwardenError> {
    let report = client().status()?;

    if json {
        let rendered = serde_json::to_string_pretty(&report).map_err(|e| {
            TunwardenError::Daemon(DaemonError::Ipc {
                reason: format!("Failed to render status: {}", e),
            })
        })?;
        println!("{}", rendered);
    } else {
        print_report(&report);
    }
    Ok(())
}
