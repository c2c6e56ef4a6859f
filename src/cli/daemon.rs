//! `run` and `stop` commands

use std::time::Duration;

use colored::Colorize;
use tracing::info;

use tunwarden_core::config::toml_config::get_config_dir;
use tunwarden_core::error::TunwardenError;

use crate::daemon::ipc::{get_default_pid_file, get_default_socket_path};
use crate::daemon::process::DaemonProcess;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Start the daemon, detached unless `foreground` is set
pub fn run_daemon(foreground: bool) -> Result<(), TunwardenError> {
    let config_dir = get_config_dir()?;
    let socket_path = get_default_socket_path();
    let mut process = DaemonProcess::new(get_default_pid_file());
    process.ensure_not_running()?;

    if foreground {
        process.write_pid()?;
    } else {
        println!(
            "{} Starting tunwarden daemon (PID file {})",
            "▶".green(),
            process.pid_file().display()
        );
        process.daemonize()?;
    }

    // Built after daemonizing so no runtime threads are lost to the fork
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(crate::daemon::serve(&config_dir, &socket_path));
    info!("Daemon exiting");
    result
}

pub fn stop_daemon() -> Result<(), TunwardenError> {
    let pid = DaemonProcess::new(get_default_pid_file()).stop(STOP_TIMEOUT)?;
    println!("{} Stopped tunwarden daemon (PID {})", "■".green(), pid);
    Ok(())
}
