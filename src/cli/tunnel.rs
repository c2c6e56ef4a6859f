//! Tunnel commands: state changes, import, rename, delete and list

use std::path::Path;

use colored::Colorize;

use tunwarden_core::config::store::{ConfigStore, FileConfigStore};
use tunwarden_core::config::toml_config::get_config_dir;
use tunwarden_core::error::{ConfigError, DaemonError, TunnelError, TunwardenError};
use tunwarden_core::tunnel::is_valid_name;
use tunwarden_core::types::{ConnectionStatus, StateRequest, TunnelState};

use super::client;
use super::status::colored_state;
use crate::daemon::ipc::{parse_tunnel_file, IpcMessage};

/// Bring one tunnel up, down or toggle it; `None` targets the last used tunnel
pub fn run_set_state(name: Option<String>, request: StateRequest) -> Result<(), TunwardenError> {
    let (name, state, status) = client().set_state(name, request)?;
    let detail = match (state, status) {
        (TunnelState::Up, ConnectionStatus::Connecting) => " (waiting for handshake)",
        _ => "",
    };
    println!("{} is {}{}", name.bold(), colored_state(state), detail);
    Ok(())
}

pub fn run_down_all() -> Result<(), TunwardenError> {
    let failed = client().set_all_down()?;
    if failed.is_empty() {
        println!("{} All tunnels are down", "✓".green());
        return Ok(());
    }

    for (name, reason) in &failed {
        eprintln!("{} {}: {}", "✗".red(), name.bold(), reason);
    }
    Err(TunwardenError::Daemon(DaemonError::Remote {
        message: format!("{} tunnel(s) could not be brought down", failed.len()),
        config: false,
    }))
}

/// Import a tunnel file, through the daemon when it runs
pub fn run_import(name: &str, file: &Path) -> Result<(), TunwardenError> {
    let contents = std::fs::read_to_string(file).map_err(|e| {
        TunwardenError::Config(ConfigError::LoadFailed {
            path: format!("{}: {}", file.display(), e),
        })
    })?;

    let client = client();
    if client.is_reachable() {
        client.request(IpcMessage::ImportRequest {
            name: name.to_string(),
            contents,
        })?;
    } else {
        if !is_valid_name(name) {
            return Err(TunwardenError::Tunnel(TunnelError::InvalidName {
                name: name.to_string(),
            }));
        }
        let config = parse_tunnel_file(&contents)?;
        FileConfigStore::new(&get_config_dir()?).create(name, &config)?;
    }

    println!("{} Imported tunnel {}", "✓".green(), name.bold());
    Ok(())
}

pub fn run_rename(name: &str, new_name: &str) -> Result<(), TunwardenError> {
    client().request(IpcMessage::RenameRequest {
        name: name.to_string(),
        new_name: new_name.to_string(),
    })?;
    println!("{} Renamed {} to {}", "✓".green(), name, new_name.bold());
    Ok(())
}

pub fn run_delete(name: &str) -> Result<(), TunwardenError> {
    client().request(IpcMessage::DeleteRequest {
        name: name.to_string(),
    })?;
    println!("{} Deleted tunnel {}", "✓".green(), name.bold());
    Ok(())
}

/// List tunnels; states are only known while the daemon runs
pub fn run_list() -> Result<(), TunwardenError> {
    match client().status() {
        Ok(report) => {
            for tunnel in &report.tunnels {
                println!("{:<16} {}", tunnel.name, colored_state(tunnel.state));
            }
            Ok(())
        }
        Err(TunwardenError::Daemon(DaemonError::NotRunning)) => {
            for name in FileConfigStore::new(&get_config_dir()?).enumerate()? {
                println!("{}", name);
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}
