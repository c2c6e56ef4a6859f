//! Userspace engine
//!
//! Runs one `amneziawg-go` process per tunnel in the foreground, applies the
//! configuration with `awg setconf` and configures addresses with `ip`.
//! Only one tunnel runs at a time: bringing a tunnel up stops the others.

use super::{
    parse_interfaces, parse_show_dump, run_command, write_runtime_config, Backend, BackendKind,
    EngineSettings,
};
use crate::config::TunnelConfig;
use crate::error::BackendError;
use crate::types::{Statistics, TunnelState};
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::{BTreeSet, HashMap};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// How long to wait for the engine to create its interface
const INTERFACE_WAIT_ATTEMPTS: u32 = 50;
const INTERFACE_WAIT_STEP: Duration = Duration::from_millis(100);

pub struct UserspaceBackend {
    settings: EngineSettings,
    engines: Mutex<HashMap<String, Child>>,
}

impl UserspaceBackend {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            engines: Mutex::new(HashMap::new()),
        }
    }

    fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.process_stop_timeout_secs)
    }

    async fn spawn_engine(&self, name: &str) -> Result<Child, BackendError> {
        let mut child = Command::new(&self.settings.userspace_engine)
            .arg("-f")
            .arg(name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BackendError::EngineUnavailable {
                    reason: format!("{} not found", self.settings.userspace_engine),
                },
                _ => BackendError::ProcessSpawn {
                    reason: e.to_string(),
                },
            })?;

        for _ in 0..INTERFACE_WAIT_ATTEMPTS {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(BackendError::ProcessSpawn {
                    reason: format!("{} exited early with {}", self.settings.userspace_engine, status),
                });
            }
            if self.interfaces().await.contains(name) {
                debug!("Interface {} created by engine", name);
                return Ok(child);
            }
            tokio::time::sleep(INTERFACE_WAIT_STEP).await;
        }

        if let Err(e) = terminate(&mut child, name, self.stop_timeout()).await {
            warn!("Failed to stop engine for {}: {}", name, e);
        }
        Err(BackendError::ProcessSpawn {
            reason: format!("interface {} did not appear", name),
        })
    }

    /// Apply keys, peers, addresses and link settings to a fresh interface
    async fn configure(&self, name: &str, config: &TunnelConfig) -> Result<(), BackendError> {
        let path = write_runtime_config(&self.settings, name, &config.to_setconf_string()).await?;
        let path_str = path.to_string_lossy().to_string();
        let result = run_command(&self.settings.awg, &["setconf", name, path_str.as_str()]).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!("Failed to remove {}: {}", path_str, e);
        }
        result?.check(&format!("{} setconf {}", self.settings.awg, name))?;

        let ip = self.settings.ip.as_str();
        for address in &config.interface.addresses {
            run_command(ip, &["address", "add", address.as_str(), "dev", name])
                .await?
                .check(&format!("{} address add {} dev {}", ip, address, name))?;
        }

        let mtu = config.interface.mtu.map(|m| m.to_string());
        let mut link_args = vec!["link", "set"];
        if let Some(ref mtu) = mtu {
            link_args.extend_from_slice(&["mtu", mtu.as_str()]);
        }
        link_args.extend_from_slice(&["up", "dev", name]);
        run_command(ip, &link_args)
            .await?
            .check(&format!("{} link set up dev {}", ip, name))?;
        Ok(())
    }

    async fn interfaces(&self) -> BTreeSet<String> {
        match run_command(&self.settings.awg, &["show", "interfaces"]).await {
            Ok(output) if output.success() => parse_interfaces(&output.stdout),
            _ => BTreeSet::new(),
        }
    }
}

#[async_trait]
impl Backend for UserspaceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Userspace
    }

    #[instrument(skip(self, config))]
    async fn bring_up(&self, name: &str, config: &TunnelConfig) -> Result<TunnelState, BackendError> {
        let mut engines = self.engines.lock().await;

        // One tunnel at a time; a running instance of `name` is restarted
        let names: Vec<String> = engines.keys().cloned().collect();
        for running in names {
            if let Some(mut child) = engines.remove(&running) {
                info!("Stopping {} before bringing {} up", running, name);
                terminate(&mut child, &running, self.stop_timeout()).await?;
            }
        }

        let mut child = self.spawn_engine(name).await?;
        if let Err(e) = self.configure(name, config).await {
            warn!("Failed to configure {}: {}", name, e);
            if let Err(stop) = terminate(&mut child, name, self.stop_timeout()).await {
                warn!("Failed to stop engine for {}: {}", name, stop);
            }
            return Err(e);
        }

        engines.insert(name.to_string(), child);
        info!("Tunnel {} is up", name);
        Ok(TunnelState::Up)
    }

    #[instrument(skip(self))]
    async fn bring_down(&self, name: &str) -> Result<(), BackendError> {
        let mut engines = self.engines.lock().await;
        match engines.remove(name) {
            Some(mut child) => {
                terminate(&mut child, name, self.stop_timeout()).await?;
                info!("Tunnel {} is down", name);
            }
            None => debug!("Tunnel {} already down", name),
        }
        Ok(())
    }

    async fn current_state(&self, name: &str) -> TunnelState {
        let mut engines = self.engines.lock().await;
        match engines.get_mut(name).map(|child| child.try_wait()) {
            Some(Ok(None)) => TunnelState::Up,
            Some(_) => {
                warn!("Engine process for {} is gone", name);
                engines.remove(name);
                TunnelState::Down
            }
            None => TunnelState::Down,
        }
    }

    async fn statistics(&self, name: &str) -> Statistics {
        match run_command(&self.settings.awg, &["show", name, "dump"]).await {
            Ok(output) if output.success() => parse_show_dump(&output.stdout),
            _ => Statistics::new(),
        }
    }

    async fn running_tunnel_names(&self) -> BTreeSet<String> {
        let mut engines = self.engines.lock().await;
        engines.retain(|_, child| matches!(child.try_wait(), Ok(None)));
        engines.keys().cloned().collect()
    }

    async fn version(&self) -> Result<String, BackendError> {
        let output = run_command(&self.settings.userspace_engine, &["--version"])
            .await?
            .check(&format!("{} --version", self.settings.userspace_engine))?;
        output
            .stdout
            .into_iter()
            .map(|line| line.trim().to_string())
            .find(|line| !line.is_empty())
            .ok_or_else(|| BackendError::EngineUnavailable {
                reason: "engine reported no version".to_string(),
            })
    }
}

/// Stop an engine process: SIGTERM, wait, then SIGKILL
async fn terminate(child: &mut Child, name: &str, timeout: Duration) -> Result<(), BackendError> {
    let Some(pid) = child.id() else {
        // Already reaped
        return Ok(());
    };

    debug!("Sending SIGTERM to engine {} (pid {})", name, pid);
    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => {}
        Err(nix::errno::Errno::ESRCH) => return Ok(()),
        Err(e) => warn!("Failed to send SIGTERM to {}: {}", pid, e),
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            debug!("Engine {} exited with {}", name, status);
            Ok(())
        }
        _ => {
            warn!("Engine {} did not respond to SIGTERM, sending SIGKILL", name);
            child.kill().await.map_err(|_| BackendError::TerminationFailed {
                name: name.to_string(),
            })
        }
    }
}
