//! Background daemon hosting the application context
//!
//! The daemon owns the tunnel registry, the network monitor and the
//! reconnection loop; the CLI talks to it over a Unix socket.

pub mod ipc;
pub mod process;

use std::path::Path;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use tunwarden_core::context::AppContext;
use tunwarden_core::error::TunwardenError;

use ipc::IpcServer;

/// Run the daemon until SIGTERM or Ctrl-C
///
/// Tunnels are left running on exit; the running set is persisted so a
/// later start can restore it.
pub async fn serve(config_dir: &Path, socket_path: &Path) -> Result<(), TunwardenError> {
    let ctx = Arc::new(AppContext::open(config_dir)?);
    ctx.start();

    let server = IpcServer::bind(socket_path, Arc::clone(&ctx))?;
    let server_task = tokio::spawn(server.run());
    info!("Daemon ready, configuration in {}", ctx.config_dir().display());

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = terminate.recv() => info!("Received SIGTERM"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl-C"),
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        },
    }

    server_task.abort();
    // Dropping the server removes the socket
    let _ = server_task.await;
    ctx.shutdown().await;
    Ok(())
}
