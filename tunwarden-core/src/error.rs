//! Error types for the tunwarden tunnel supervisor
//!
//! This module defines all error types used throughout the application,
//! providing consistent error handling and user-friendly error messages.

use thiserror::Error;

/// Main error type for tunwarden
#[derive(Error, Debug)]
pub enum TunwardenError {
    /// Errors related to configuration loading/parsing
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors related to tunnel registry operations
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Errors reported by a tunnel engine backend
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Errors related to network monitoring
    #[error("Network monitor error: {0}")]
    Monitor(#[from] MonitorError),

    /// Errors talking to or managing the background daemon
    #[error("Daemon error: {0}")]
    Daemon(#[from] DaemonError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl TunwardenError {
    /// Whether the error is caused by configuration rather than a runtime failure
    pub fn is_configuration(&self) -> bool {
        match self {
            TunwardenError::Config(_) | TunwardenError::Toml(_) | TunwardenError::TomlSerialize(_) => {
                true
            }
            TunwardenError::Tunnel(TunnelError::StateChangeRejected { .. }) => false,
            TunwardenError::Tunnel(_) => true,
            TunwardenError::Daemon(DaemonError::Remote { config, .. }) => *config,
            TunwardenError::Backend(_)
            | TunwardenError::Monitor(_)
            | TunwardenError::Daemon(_)
            | TunwardenError::Io(_) => false,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {path}")]
    LoadFailed { path: String },

    #[error("Failed to save configuration file: {path}")]
    SaveFailed { path: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation error: {message}")]
    ValidationError { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },
}

/// Errors raised by a tunnel engine backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Tunnel engine unavailable: {reason}")]
    EngineUnavailable { reason: String },

    #[error("Command `{command}` failed with exit code {code}")]
    CommandFailed { command: String, code: i32 },

    #[error("Failed to spawn process: {reason}")]
    ProcessSpawn { reason: String },

    #[error("Failed to terminate engine process for {name}")]
    TerminationFailed { name: String },

    #[error("Unable to determine kernel module version")]
    UnknownKernelModule,

    #[error("I/O error: {message}")]
    Io { message: String },
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::Io {
            message: e.to_string(),
        }
    }
}

/// Tunnel registry errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Tunnel {name} not found")]
    NotFound { name: String },

    #[error("Tunnel {name} already exists")]
    AlreadyExists { name: String },

    #[error("Invalid tunnel name: {name}")]
    InvalidName { name: String },

    #[error("Tunnel {name} rejected state change: {source}")]
    StateChangeRejected {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("Config store error for {name}: {message}")]
    Store { name: String, message: String },

    #[error("No tunnel has been used yet")]
    NoLastUsedTunnel,
}

/// Errors that can occur during network monitoring
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Permission to observe network state not granted")]
    PermissionDenied,

    #[error("D-Bus connection failed: {0}")]
    DBusConnectionFailed(#[from] zbus::Error),

    #[error("NetworkManager not available")]
    NetworkManagerUnavailable,

    #[error("Failed to register network callback: {0}")]
    RegistrationFailed(String),

    #[error("Failed to query network state: {0}")]
    QueryFailed(String),
}

/// Daemon lifecycle and IPC errors
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Daemon is not running")]
    NotRunning,

    #[error("Daemon is already running with PID {pid}")]
    AlreadyRunning { pid: i32 },

    #[error("PID file error: {reason}")]
    PidFile { reason: String },

    #[error("Failed to daemonize process: {reason}")]
    Daemonize { reason: String },

    #[error("Failed to signal daemon process {pid}: {reason}")]
    Signal { pid: i32, reason: String },

    #[error("IPC failure: {reason}")]
    Ipc { reason: String },

    /// The daemon handled the request and reported an error
    #[error("{message}")]
    Remote { message: String, config: bool },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, TunwardenError>;
