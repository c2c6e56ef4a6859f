//! Tunnel engine backends
//!
//! A [`Backend`] brings tunnels up and down and reports their state and
//! traffic statistics. Two engines exist: [`kernel::KernelBackend`] drives
//! the kernel module through `awg-quick` with elevated privileges, and
//! [`userspace::UserspaceBackend`] runs the userspace engine process.
//! [`selector::BackendSelector`] picks one of them once per process.

use crate::config::TunnelConfig;
use crate::error::BackendError;
use crate::types::{PeerStats, Statistics, TunnelState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

pub mod kernel;
pub mod root_shell;
pub mod selector;
pub mod userspace;

pub use selector::{BackendHandle, BackendSelector};

/// Which engine a backend drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Kernel module driven through `awg-quick` as root
    Kernel,
    /// Userspace engine process
    Userspace,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Kernel => write!(f, "kernel"),
            BackendKind::Userspace => write!(f, "userspace"),
        }
    }
}

/// Capability interface of a tunnel engine
///
/// Only the tunnel registry calls into a backend.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Bring `name` up with `config`, returning the resulting state
    async fn bring_up(&self, name: &str, config: &TunnelConfig)
        -> Result<TunnelState, BackendError>;

    async fn bring_down(&self, name: &str) -> Result<(), BackendError>;

    async fn current_state(&self, name: &str) -> TunnelState;

    /// Traffic statistics; empty when the engine cannot be queried
    async fn statistics(&self, name: &str) -> Statistics;

    async fn running_tunnel_names(&self) -> BTreeSet<String>;

    async fn version(&self) -> Result<String, BackendError>;
}

/// Engine tool locations and limits (`[engine]` in config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_awg_quick")]
    pub awg_quick: String,

    #[serde(default = "default_awg")]
    pub awg: String,

    #[serde(default = "default_ip")]
    pub ip: String,

    #[serde(default = "default_userspace_engine")]
    pub userspace_engine: String,

    /// Presence of this directory means the kernel module is loaded
    #[serde(default = "default_kernel_module_path")]
    pub kernel_module_path: PathBuf,

    /// Where rendered configuration files are written for the engine tools
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,

    /// Seconds to wait for an engine process to exit after SIGTERM
    #[serde(default = "default_process_stop_timeout")]
    pub process_stop_timeout_secs: u64,
}

fn default_awg_quick() -> String {
    "awg-quick".to_string()
}
fn default_awg() -> String {
    "awg".to_string()
}
fn default_ip() -> String {
    "ip".to_string()
}
fn default_userspace_engine() -> String {
    "amneziawg-go".to_string()
}
fn default_kernel_module_path() -> PathBuf {
    PathBuf::from("/sys/module/amneziawg")
}
fn default_runtime_dir() -> PathBuf {
    std::env::temp_dir().join("tunwarden")
}
fn default_process_stop_timeout() -> u64 {
    5
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            awg_quick: default_awg_quick(),
            awg: default_awg(),
            ip: default_ip(),
            userspace_engine: default_userspace_engine(),
            kernel_module_path: default_kernel_module_path(),
            runtime_dir: default_runtime_dir(),
            process_stop_timeout_secs: default_process_stop_timeout(),
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("awg_quick", &self.awg_quick),
            ("awg", &self.awg),
            ("ip", &self.ip),
            ("userspace_engine", &self.userspace_engine),
        ] {
            if value.trim().is_empty() {
                return Err(format!("engine.{} cannot be empty", field));
            }
        }
        if self.process_stop_timeout_secs < 1 || self.process_stop_timeout_secs > 60 {
            return Err(format!(
                "engine.process_stop_timeout_secs must be between 1 and 60, got: {}",
                self.process_stop_timeout_secs
            ));
        }
        Ok(())
    }
}

/// Exit code and stdout lines of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: Vec<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Turn a non-zero exit code into [`BackendError::CommandFailed`]
    pub fn check(self, command: &str) -> Result<Self, BackendError> {
        if self.success() {
            Ok(self)
        } else {
            Err(BackendError::CommandFailed {
                command: command.to_string(),
                code: self.code,
            })
        }
    }
}

/// Run `program` with `args` and collect its output
pub(crate) async fn run_command(program: &str, args: &[&str]) -> Result<CommandOutput, BackendError> {
    debug!("Running {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BackendError::EngineUnavailable {
                reason: format!("{} not found", program),
            },
            std::io::ErrorKind::PermissionDenied => BackendError::PermissionDenied {
                reason: format!("not allowed to execute {}", program),
            },
            _ => BackendError::ProcessSpawn {
                reason: format!("{}: {}", program, e),
            },
        })?;

    Ok(CommandOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect(),
    })
}

/// Write a rendered configuration to `<runtime_dir>/<name>.conf`
///
/// The directory is owner-only and the file is created with mode 0600
/// because it carries the private key.
pub(crate) async fn write_runtime_config(
    settings: &EngineSettings,
    name: &str,
    contents: &str,
) -> Result<PathBuf, BackendError> {
    use std::os::unix::fs::PermissionsExt;

    let dir = &settings.runtime_dir;
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;

    let path = dir.join(format!("{}.conf", name));
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true).mode(0o600);
    let mut file = options.open(&path).await?;
    tokio::io::AsyncWriteExt::write_all(&mut file, contents.as_bytes()).await?;
    tokio::io::AsyncWriteExt::flush(&mut file).await?;
    Ok(path)
}

/// Parse the output of `awg show <name> dump`
///
/// The first line describes the interface; each following line is a peer
/// with eight tab separated fields: public key, preshared key, endpoint,
/// allowed ips, latest handshake (seconds), rx bytes, tx bytes, keepalive.
/// Malformed lines are skipped.
pub fn parse_show_dump(lines: &[String]) -> Statistics {
    let mut stats = Statistics::new();
    for line in lines {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() != 8 {
            continue;
        }
        let (Ok(handshake), Ok(rx), Ok(tx)) = (
            parts[4].parse::<u64>(),
            parts[5].parse::<u64>(),
            parts[6].parse::<u64>(),
        ) else {
            continue;
        };
        stats.add(
            parts[0],
            PeerStats {
                rx_bytes: rx,
                tx_bytes: tx,
                latest_handshake_epoch_millis: handshake.saturating_mul(1000),
            },
        );
    }
    stats
}

/// Parse the output of `awg show interfaces`
pub fn parse_interfaces(lines: &[String]) -> BTreeSet<String> {
    lines
        .iter()
        .flat_map(|line| line.split_whitespace())
        .map(str::to_string)
        .collect()
}
