//! PID file guard: created on start, removed on clean exit.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

/// Holds the daemon's PID file for the lifetime of the process.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current PID, refusing if the stored PID is still alive.
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        if let Ok(raw) = std::fs::read_to_string(path) {
            if let Ok(pid) = raw.trim().parse::<i32>() {
                if pid > 0 && kill(Pid::from_raw(pid), None).is_ok() {
                    bail!(
                        "opsipxeconfd already running with pid {} (pid file '{}')",
                        pid,
                        path.display()
                    );
                }
                debug!(pid, "Ignoring stale pid file");
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create '{}'", parent.display()))?;
        }
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("cannot write pid file '{}'", path.display()))?;
        info!(path = %path.display(), "Created pid file");

        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(
                path = %self.path.display(),
                error = %err,
                "Failed to remove pid file"
            );
        } else {
            debug!(path = %self.path.display(), "Removed pid file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opsipxeconfd.pid");

        {
            let _pid_file = PidFile::create(&path).unwrap();
            let stored = std::fs::read_to_string(&path).unwrap();
            assert_eq!(stored.trim(), std::process::id().to_string());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_refuses_live_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opsipxeconfd.pid");
        // Our own PID is certainly alive.
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        let err = PidFile::create(&path).unwrap_err();
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn test_replaces_stale_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opsipxeconfd.pid");
        // PIDs are bounded well below i32::MAX; this one cannot be alive.
        std::fs::write(&path, "2147483000\n").unwrap();

        let _pid_file = PidFile::create(&path).unwrap();
        let stored = std::fs::read_to_string(&path).unwrap();
        assert_eq!(stored.trim(), std::process::id().to_string());
    }
}
