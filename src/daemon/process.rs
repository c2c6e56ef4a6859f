//! Daemon process management
//!
//! PID file handling, detaching from the terminal and stopping a running
//! daemon.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant};

use daemonize::Daemonize;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use tunwarden_core::error::{DaemonError, TunwardenError};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn pid_error(reason: impl Into<String>) -> TunwardenError {
    TunwardenError::Daemon(DaemonError::PidFile {
        reason: reason.into(),
    })
}

/// Represents the daemon process through its PID file
pub struct DaemonProcess {
    pid_file: PathBuf,
    /// Remove the PID file on drop; only the daemon itself owns it
    owned: bool,
}

impl DaemonProcess {
    pub fn new(pid_file: PathBuf) -> Self {
        Self {
            pid_file,
            owned: false,
        }
    }

    /// PID of a live daemon, cleaning up a stale PID file
    pub fn running_pid(&self) -> Result<Option<i32>, TunwardenError> {
        if !self.pid_file.exists() {
            return Ok(None);
        }

        let pid = self.read_pid()?;
        match signal::kill(Pid::from_raw(pid), None) {
            // EPERM means the process exists but belongs to someone else
            Ok(()) | Err(Errno::EPERM) => Ok(Some(pid)),
            Err(Errno::ESRCH) => {
                debug!("Removing stale PID file for {}", pid);
                let _ = fs::remove_file(&self.pid_file);
                Ok(None)
            }
            Err(e) => Err(pid_error(format!("Failed to check process status: {}", e))),
        }
    }

    /// Refuse to start a second daemon
    pub fn ensure_not_running(&self) -> Result<(), TunwardenError> {
        match self.running_pid()? {
            Some(pid) => Err(TunwardenError::Daemon(DaemonError::AlreadyRunning { pid })),
            None => Ok(()),
        }
    }

    fn ensure_parent(&self) -> Result<(), TunwardenError> {
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| pid_error(format!("Failed to create PID file directory: {}", e)))?;
        }
        Ok(())
    }

    /// Detach from the terminal
    ///
    /// Must run before any tokio runtime exists. The parent process exits
    /// inside this call; only the detached child returns.
    pub fn daemonize(&mut self) -> Result<(), TunwardenError> {
        self.ensure_parent()?;

        let working_directory = std::env::current_dir().map_err(|e| {
            TunwardenError::Daemon(DaemonError::Daemonize {
                reason: format!("Failed to get current directory: {}", e),
            })
        })?;

        Daemonize::new()
            .pid_file(&self.pid_file)
            .chown_pid_file(true)
            .working_directory(working_directory)
            .umask(0o027)
            .start()
            .map_err(|e| {
                TunwardenError::Daemon(DaemonError::Daemonize {
                    reason: e.to_string(),
                })
            })?;

        self.owned = true;
        info!("Successfully daemonized process, PID: {}", process::id());
        Ok(())
    }

    /// Record the current process when running in the foreground
    pub fn write_pid(&mut self) -> Result<(), TunwardenError> {
        self.ensure_parent()?;
        fs::write(&self.pid_file, format!("{}\n", process::id()))
            .map_err(|e| pid_error(format!("Failed to write PID file: {}", e)))?;
        self.owned = true;
        Ok(())
    }

    fn read_pid(&self) -> Result<i32, TunwardenError> {
        let pid_content = fs::read_to_string(&self.pid_file)
            .map_err(|e| pid_error(format!("Failed to read PID file: {}", e)))?;
        pid_content
            .trim()
            .parse()
            .map_err(|_| pid_error("Invalid PID in PID file"))
    }

    /// Stop the daemon: SIGTERM, then SIGKILL once `timeout` has passed
    pub fn stop(&self, timeout: Duration) -> Result<i32, TunwardenError> {
        let pid = self
            .running_pid()?
            .ok_or(TunwardenError::Daemon(DaemonError::NotRunning))?;
        let target = Pid::from_raw(pid);

        signal::kill(target, Signal::SIGTERM).map_err(|e| {
            TunwardenError::Daemon(DaemonError::Signal {
                pid,
                reason: e.to_string(),
            })
        })?;

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if signal::kill(target, None) == Err(Errno::ESRCH) {
                let _ = fs::remove_file(&self.pid_file);
                info!("Stopped daemon process {}", pid);
                return Ok(pid);
            }
            std::thread::sleep(STOP_POLL_INTERVAL);
        }

        warn!("Daemon {} did not respond to SIGTERM, sending SIGKILL", pid);
        match signal::kill(target, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                return Err(TunwardenError::Daemon(DaemonError::Signal {
                    pid,
                    reason: e.to_string(),
                }))
            }
        }

        let _ = fs::remove_file(&self.pid_file);
        info!("Killed daemon process {}", pid);
        Ok(pid)
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        if self.owned {
            let _ = fs::remove_file(&self.pid_file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_pid_file_means_not_running() {
        let dir = tempdir().unwrap();
        let process = DaemonProcess::new(dir.path().join("tunwarden.pid"));

        assert_eq!(process.running_pid().unwrap(), None);
        assert!(process.ensure_not_running().is_ok());
        let err = process.stop(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, TunwardenError::Daemon(DaemonError::NotRunning)));
    }

    #[test]
    fn test_foreground_pid_file_lifecycle() {
        // Given: A foreground daemon that recorded its own PID
        let dir = tempdir().unwrap();
        let path = dir.path().join("run").join("tunwarden.pid");
        let mut process = DaemonProcess::new(path.clone());
        process.write_pid().unwrap();

        // Then: Another instance sees it as running
        let observer = DaemonProcess::new(path.clone());
        assert_eq!(observer.running_pid().unwrap(), Some(process::id() as i32));
        let err = observer.ensure_not_running().unwrap_err();
        assert!(matches!(
            err,
            TunwardenError::Daemon(DaemonError::AlreadyRunning { .. })
        ));

        // And: The observer does not remove it, the owner does
        drop(observer);
        assert!(path.exists());
        drop(process);
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_pid_file_is_removed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tunwarden.pid");

        // A reaped child gives a PID that no longer exists
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        fs::write(&path, pid.to_string()).unwrap();

        let process = DaemonProcess::new(path.clone());
        assert_eq!(process.running_pid().unwrap(), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_invalid_pid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tunwarden.pid");
        fs::write(&path, "not-a-pid").unwrap();

        let err = DaemonProcess::new(path).running_pid().unwrap_err();
        assert!(matches!(err, TunwardenError::Daemon(DaemonError::PidFile { .. })));
    }

    #[test]
    fn test_stop_terminates_process() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tunwarden.pid");
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        fs::write(&path, child.id().to_string()).unwrap();

        // Reap the child in the background so it does not linger as a zombie
        let reaper = std::thread::spawn(move || child.wait());

        let pid = DaemonProcess::new(path.clone())
            .stop(Duration::from_secs(5))
            .unwrap();
        assert!(pid > 0);
        assert!(!path.exists());
        assert!(reaper.join().unwrap().is_ok());
    }
}
