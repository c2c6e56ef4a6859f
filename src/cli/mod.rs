//! CLI command implementations
//!
//! This module contains the implementation of all CLI subcommands.

pub mod daemon;
pub mod knob;
pub mod status;
pub mod tunnel;

use crate::daemon::ipc::{get_default_socket_path, IpcClient};

/// Client for the daemon at the default socket
fn client() -> IpcClient {
    IpcClient::new(get_default_socket_path())
}
