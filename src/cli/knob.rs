//! `knob` command

use colored::Colorize;

use tunwarden_core::config::knobs::KnobStore;
use tunwarden_core::config::toml_config::get_config_dir;
use tunwarden_core::error::{DaemonError, TunwardenError};

use super::client;
use crate::daemon::ipc::{IpcMessage, Knob};

/// Set a user knob, through the daemon when it runs so it sees the change
pub fn run_set_knob(knob: Knob, enabled: bool) -> Result<(), TunwardenError> {
    match client().request(IpcMessage::SetKnobRequest { knob, enabled }) {
        Ok(()) => {}
        Err(TunwardenError::Daemon(DaemonError::NotRunning)) => {
            let knobs = KnobStore::open(&get_config_dir()?)?;
            knob.apply(&knobs, enabled)?;
        }
        Err(e) => return Err(e),
    }

    let value = if enabled { "on".green() } else { "off".red() };
    println!("{:?} set to {}", knob, value);
    Ok(())
}
