//! Elevated command execution
//!
//! The kernel engine needs root. When the daemon already runs as root
//! commands are executed directly, otherwise they go through `sudo -n` so
//! a missing sudo rule fails immediately instead of prompting.

use super::{run_command, CommandOutput};
use crate::error::BackendError;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Elevation {
    Root,
    Sudo,
}

/// Handle for running commands with root privileges
#[derive(Debug, Default)]
pub struct RootShell {
    elevation: OnceCell<Elevation>,
}

impl RootShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire elevation, probing `sudo -n true` when not running as root
    ///
    /// Succeeds at most once; later calls return immediately.
    pub async fn start(&self) -> Result<(), BackendError> {
        self.elevation
            .get_or_try_init(|| async {
                if nix::unistd::geteuid().is_root() {
                    debug!("Running as root, no elevation needed");
                    return Ok(Elevation::Root);
                }

                let probe = run_command("sudo", &["-n", "true"]).await?;
                if probe.success() {
                    info!("Elevation through sudo granted");
                    Ok(Elevation::Sudo)
                } else {
                    warn!("sudo refused non-interactive elevation (exit {})", probe.code);
                    Err(BackendError::PermissionDenied {
                        reason: "root shell could not be started".to_string(),
                    })
                }
            })
            .await
            .map(|_| ())
    }

    pub fn is_started(&self) -> bool {
        self.elevation.initialized()
    }

    /// Run `program` with root privileges
    pub async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, BackendError> {
        match self.elevation.get() {
            Some(Elevation::Root) => run_command(program, args).await,
            Some(Elevation::Sudo) => {
                let mut sudo_args = Vec::with_capacity(args.len() + 2);
                sudo_args.push("-n");
                sudo_args.push(program);
                sudo_args.extend_from_slice(args);
                run_command("sudo", &sudo_args).await
            }
            None => Err(BackendError::PermissionDenied {
                reason: "root shell not started".to_string(),
            }),
        }
    }
}
