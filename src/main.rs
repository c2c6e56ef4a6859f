//! tunwarden - AmneziaWG tunnel supervisor
//!
//! Keeps tunnels running across network changes. `tunwarden run` starts the
//! daemon; every other command talks to it over a Unix socket.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tunwarden_core::{error::TunwardenError, init_logging, types::StateRequest};

mod cli;
mod daemon;

use daemon::ipc::Knob;

#[derive(Parser)]
#[command(name = "tunwarden")]
#[command(version)]
#[command(about = "Supervisor that keeps AmneziaWG tunnels alive across network changes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Run {
        /// Stay attached to the terminal
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the daemon, leaving tunnels as they are
    Stop,
    /// Show daemon, network and tunnel status
    Status {
        /// Print machine readable JSON
        #[arg(long)]
        json: bool,
    },
    /// List configured tunnels
    List,
    /// Bring a tunnel up (defaults to the last used tunnel)
    Up { name: Option<String> },
    /// Bring a tunnel down (defaults to the last used tunnel)
    Down { name: Option<String> },
    /// Toggle a tunnel (defaults to the last used tunnel)
    Toggle { name: Option<String> },
    /// Bring every tunnel down
    DownAll,
    /// Import a tunnel from a TOML tunnel file
    Import { name: String, file: PathBuf },
    /// Rename a tunnel
    Rename { name: String, new_name: String },
    /// Delete a tunnel
    Delete { name: String },
    /// Change a user setting
    Knob {
        #[arg(value_enum)]
        knob: Knob,
        #[arg(value_enum)]
        value: Switch,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

fn main() {
    // Initialize logging
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(2);
    }

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { foreground } => cli::daemon::run_daemon(foreground),
        Commands::Stop => cli::daemon::stop_daemon(),
        Commands::Status { json } => cli::status::run_status(json),
        Commands::List => cli::tunnel::run_list(),
        Commands::Up { name } => cli::tunnel::run_set_state(name, StateRequest::Up),
        Commands::Down { name } => cli::tunnel::run_set_state(name, StateRequest::Down),
        Commands::Toggle { name } => cli::tunnel::run_set_state(name, StateRequest::Toggle),
        Commands::DownAll => cli::tunnel::run_down_all(),
        Commands::Import { name, file } => cli::tunnel::run_import(&name, &file),
        Commands::Rename { name, new_name } => cli::tunnel::run_rename(&name, &new_name),
        Commands::Delete { name } => cli::tunnel::run_delete(&name),
        Commands::Knob { knob, value } => {
            cli::knob::run_set_knob(knob, matches!(value, Switch::On))
        }
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(exit_code(&e));
        }
    }
}

/// Configuration problems exit with 2, runtime failures with 1
fn exit_code(error: &TunwardenError) -> i32 {
    if error.is_configuration() {
        2
    } else {
        1
    }
}
