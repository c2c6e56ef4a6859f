//! Unix socket IPC for daemon communication
//!
//! One JSON request per connection. The client half-closes its side after
//! writing; the daemon reads to EOF, answers with one JSON message and closes.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use tunwarden_core::config::knobs::KnobStore;
use tunwarden_core::config::TunnelConfig;
use tunwarden_core::context::AppContext;
use tunwarden_core::error::{ConfigError, DaemonError, TunnelError, TunwardenError};
use tunwarden_core::tunnel::Tunnel;
use tunwarden_core::types::{ConnectionStatus, NetworkObservation, StateRequest, TunnelState};

/// User knobs that can be flipped from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Knob {
    /// Allow the kernel engine through a root shell
    PrivilegedEngine,
    /// Allow more than one tunnel up at a time
    MultipleTunnels,
    /// Bring previously running tunnels back when the daemon starts
    RestoreOnBoot,
}

impl Knob {
    pub fn apply(self, knobs: &KnobStore, enabled: bool) -> Result<(), TunwardenError> {
        match self {
            Knob::PrivilegedEngine => knobs.set_privileged_engine_enabled(enabled),
            Knob::MultipleTunnels => knobs.set_multiple_tunnels(enabled),
            Knob::RestoreOnBoot => knobs.update(|k| k.restore_on_boot = enabled),
        }
    }
}

/// One row of `tunwarden status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelSummary {
    pub name: String,
    pub state: TunnelState,
    pub status: ConnectionStatus,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Milliseconds since the UNIX epoch of the most recent handshake
    pub latest_handshake_epoch_millis: Option<u64>,
}

impl TunnelSummary {
    pub fn from_tunnel(tunnel: &Tunnel) -> Self {
        let stats = tunnel.statistics().unwrap_or_default();
        Self {
            name: tunnel.name(),
            state: tunnel.state(),
            status: tunnel.connection_status(),
            rx_bytes: stats.total_rx(),
            tx_bytes: stats.total_tx(),
            latest_handshake_epoch_millis: stats
                .peers()
                .map(|(_, peer)| peer.latest_handshake_epoch_millis)
                .filter(|ms| *ms > 0)
                .max(),
        }
    }
}

/// Snapshot of the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub pid: u32,
    /// Selected engine, absent while selection is still running
    pub backend: Option<String>,
    pub monitor_bound: bool,
    pub network: NetworkObservation,
    pub last_used_tunnel: Option<String>,
    pub tunnels: Vec<TunnelSummary>,
}

impl StatusReport {
    pub fn collect(ctx: &AppContext) -> Self {
        Self {
            pid: std::process::id(),
            backend: ctx.backend().get().map(|b| b.kind().to_string()),
            monitor_bound: ctx.monitor().is_bound(),
            network: ctx.monitor().observation(),
            last_used_tunnel: ctx.knobs().get().last_used_tunnel,
            tunnels: ctx
                .registry()
                .list_tunnels()
                .iter()
                .map(|t| TunnelSummary::from_tunnel(t))
                .collect(),
        }
    }
}

/// IPC message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IpcMessage {
    StatusRequest,
    StatusResponse(StatusReport),
    /// Change one tunnel, `None` meaning the last used one
    SetStateRequest {
        name: Option<String>,
        request: StateRequest,
    },
    SetStateResponse {
        name: String,
        state: TunnelState,
        status: ConnectionStatus,
    },
    SetAllDownRequest,
    /// Tunnels that could not be brought down, with the reason
    SetAllDownResponse { failed: Vec<(String, String)> },
    /// Create a tunnel from the contents of a tunnel file
    ImportRequest { name: String, contents: String },
    RenameRequest { name: String, new_name: String },
    DeleteRequest { name: String },
    SetKnobRequest { knob: Knob, enabled: bool },
    Done,
    Error { message: String, config: bool },
}

impl IpcMessage {
    fn from_error(e: &TunwardenError) -> Self {
        IpcMessage::Error {
            message: e.to_string(),
            config: e.is_configuration(),
        }
    }
}

fn ipc_error(reason: impl Into<String>) -> TunwardenError {
    TunwardenError::Daemon(DaemonError::Ipc {
        reason: reason.into(),
    })
}

/// Parse and validate a tunnel file in the stored TOML format
pub fn parse_tunnel_file(contents: &str) -> Result<TunnelConfig, TunwardenError> {
    let config: TunnelConfig = toml::from_str(contents)?;
    config.validate().map_err(|message| {
        TunwardenError::Config(ConfigError::ValidationError { message })
    })?;
    Ok(config)
}

/// IPC client for communicating with daemon
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Send a message and receive a response
    ///
    /// A missing socket or a refused connection is reported as
    /// [`DaemonError::NotRunning`]; an `Error` reply is turned back into
    /// [`DaemonError::Remote`].
    pub fn send_message(&self, message: &IpcMessage) -> Result<IpcMessage, TunwardenError> {
        let mut stream = UnixStream::connect(&self.socket_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                TunwardenError::Daemon(DaemonError::NotRunning)
            }
            _ => ipc_error(format!("Failed to connect to daemon socket: {}", e)),
        })?;

        let message_data = serde_json::to_vec(message)
            .map_err(|e| ipc_error(format!("Failed to serialize message: {}", e)))?;
        stream
            .write_all(&message_data)
            .map_err(|e| ipc_error(format!("Failed to send message: {}", e)))?;
        stream
            .shutdown(Shutdown::Write)
            .map_err(|e| ipc_error(format!("Failed to finish message: {}", e)))?;

        let mut buffer = Vec::new();
        stream
            .read_to_end(&mut buffer)
            .map_err(|e| ipc_error(format!("Failed to read response: {}", e)))?;

        match serde_json::from_slice::<IpcMessage>(&buffer)
            .map_err(|e| ipc_error(format!("Failed to deserialize response: {}", e)))?
        {
            IpcMessage::Error { message, config } => {
                Err(TunwardenError::Daemon(DaemonError::Remote { message, config }))
            }
            response => Ok(response),
        }
    }

    /// Whether a daemon answers on the socket
    pub fn is_reachable(&self) -> bool {
        UnixStream::connect(&self.socket_path).is_ok()
    }

    pub fn status(&self) -> Result<StatusReport, TunwardenError> {
        match self.send_message(&IpcMessage::StatusRequest)? {
            IpcMessage::StatusResponse(report) => Ok(report),
            other => Err(unexpected(&other)),
        }
    }

    pub fn set_state(
        &self,
        name: Option<String>,
        request: StateRequest,
    ) -> Result<(String, TunnelState, ConnectionStatus), TunwardenError> {
        match self.send_message(&IpcMessage::SetStateRequest { name, request })? {
            IpcMessage::SetStateResponse {
                name,
                state,
                status,
            } => Ok((name, state, status)),
            other => Err(unexpected(&other)),
        }
    }

    pub fn set_all_down(&self) -> Result<Vec<(String, String)>, TunwardenError> {
        match self.send_message(&IpcMessage::SetAllDownRequest)? {
            IpcMessage::SetAllDownResponse { failed } => Ok(failed),
            other => Err(unexpected(&other)),
        }
    }

    /// Send a request that is answered with `Done`
    pub fn request(&self, message: IpcMessage) -> Result<(), TunwardenError> {
        match self.send_message(&message)? {
            IpcMessage::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &IpcMessage) -> TunwardenError {
    ipc_error(format!("Unexpected response from daemon: {:?}", response))
}

/// IPC server for daemon to listen for commands
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
    ctx: Arc<AppContext>,
}

impl IpcServer {
    /// Bind the socket, replacing a stale one, and restrict it to the owner
    pub fn bind(socket_path: &Path, ctx: Arc<AppContext>) -> Result<Self, TunwardenError> {
        let _ = std::fs::remove_file(socket_path);
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(socket_path)
            .map_err(|e| ipc_error(format!("Failed to bind IPC socket: {}", e)))?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        info!("IPC socket listening at {}", socket_path.display());

        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            ctx,
        })
    }

    /// Accept connections until the task is cancelled
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &ctx).await {
                            warn!("IPC connection error: {}", e);
                        }
                    });
                }
                Err(e) => warn!("IPC accept error: {}", e),
            }
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn handle_connection(
    mut stream: tokio::net::UnixStream,
    ctx: &AppContext,
) -> Result<(), TunwardenError> {
    let mut buffer = Vec::new();
    stream
        .read_to_end(&mut buffer)
        .await
        .map_err(|e| ipc_error(format!("Failed to read IPC message: {}", e)))?;
    if buffer.is_empty() {
        // Reachability probe
        return Ok(());
    }

    let response = match serde_json::from_slice::<IpcMessage>(&buffer) {
        Ok(message) => {
            debug!("IPC request: {:?}", message);
            dispatch(ctx, message).await
        }
        Err(e) => IpcMessage::Error {
            message: format!("Malformed request: {}", e),
            config: false,
        },
    };

    let response_data = serde_json::to_vec(&response)
        .map_err(|e| ipc_error(format!("Failed to serialize response: {}", e)))?;
    stream
        .write_all(&response_data)
        .await
        .map_err(|e| ipc_error(format!("Failed to send response: {}", e)))?;
    stream.shutdown().await?;
    Ok(())
}

/// Execute one request against the application context
pub async fn dispatch(ctx: &AppContext, message: IpcMessage) -> IpcMessage {
    let result = match message {
        IpcMessage::StatusRequest => Ok(IpcMessage::StatusResponse(StatusReport::collect(ctx))),
        IpcMessage::SetStateRequest { name, request } => set_state(ctx, name, request).await,
        IpcMessage::SetAllDownRequest => {
            let failed = ctx
                .registry()
                .set_all_down()
                .await
                .into_iter()
                .map(|(name, e)| (name, e.to_string()))
                .collect();
            Ok(IpcMessage::SetAllDownResponse { failed })
        }
        IpcMessage::ImportRequest { name, contents } => parse_tunnel_file(&contents)
            .and_then(|config| ctx.registry().create(&name, config))
            .map(|_| IpcMessage::Done),
        IpcMessage::RenameRequest { name, new_name } => {
            match ctx.registry().require(&name) {
                Ok(tunnel) => ctx
                    .registry()
                    .rename(&tunnel, &new_name)
                    .await
                    .map(|_| IpcMessage::Done),
                Err(e) => Err(e),
            }
        }
        IpcMessage::DeleteRequest { name } => match ctx.registry().require(&name) {
            Ok(tunnel) => ctx.registry().delete(&tunnel).await.map(|_| IpcMessage::Done),
            Err(e) => Err(e),
        },
        IpcMessage::SetKnobRequest { knob, enabled } => {
            knob.apply(ctx.knobs(), enabled).map(|_| IpcMessage::Done)
        }
        other => Err(ipc_error(format!("Not a request: {:?}", other))),
    };

    result.unwrap_or_else(|e| IpcMessage::from_error(&e))
}

async fn set_state(
    ctx: &AppContext,
    name: Option<String>,
    request: StateRequest,
) -> Result<IpcMessage, TunwardenError> {
    let tunnel = match name {
        Some(name) => ctx.registry().require(&name)?,
        None => ctx
            .registry()
            .last_used_tunnel()
            .ok_or(TunwardenError::Tunnel(TunnelError::NoLastUsedTunnel))?,
    };

    let state = ctx.registry().set_tunnel_state(&tunnel, request).await?;
    Ok(IpcMessage::SetStateResponse {
        name: tunnel.name(),
        state,
        status: tunnel.connection_status(),
    })
}

fn runtime_dir() -> PathBuf {
    // Tests and service units may pin the directory
    if let Ok(dir) = std::env::var("TUNWARDEN_RUNTIME_DIR") {
        return PathBuf::from(dir);
    }
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => PathBuf::from("/tmp"),
    }
}

/// Get the default socket path
pub fn get_default_socket_path() -> PathBuf {
    let dir = runtime_dir();
    if std::env::var("TUNWARDEN_RUNTIME_DIR").is_err() && std::env::var("XDG_RUNTIME_DIR").is_err() {
        return dir.join(format!("tunwarden-{}.sock", nix::unistd::getuid()));
    }
    dir.join("tunwarden.sock")
}

/// Get the default PID file path
pub fn get_default_pid_file() -> PathBuf {
    let dir = runtime_dir();
    if std::env::var("TUNWARDEN_RUNTIME_DIR").is_err() && std::env::var("XDG_RUNTIME_DIR").is_err() {
        return dir.join(format!("tunwarden-{}.pid", nix::unistd::getuid()));
    }
    dir.join("tunwarden.pid")
}
