//! PID file ownership and process probing.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("server already running with pid {0}")]
    AlreadyRunning(i32),
    #[error("pid file {} could not be written", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The running server's PID file. Removed again when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: i32,
}

impl PidFile {
    /// Claim `path` for this process.
    ///
    /// A file naming a live process is an error; a stale one is overwritten.
    pub fn create(path: &Path) -> Result<Self, PidFileError> {
        let pid = std::process::id() as i32;
        let io_error = |source| PidFileError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(existing) = read_pid(path).map_err(io_error)? {
            if existing != pid && is_alive(existing) {
                return Err(PidFileError::AlreadyRunning(existing));
            }
            tracing::debug!(path = %path.display(), stale = existing, "Replacing stale pid file");
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        std::fs::write(path, format!("{pid}\n")).map_err(io_error)?;
        tracing::debug!(path = %path.display(), pid, "Pid file written");
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Only remove the file if a newer server has not claimed it.
        if matches!(read_pid(&self.path), Ok(Some(pid)) if pid == self.pid) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove pid file");
            }
        }
    }
}

/// PID recorded in `path`. Missing or unparseable files read as `None`.
pub fn read_pid(path: &Path) -> io::Result<Option<i32>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().parse().ok().filter(|pid| *pid > 0)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Whether a process with `pid` exists.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Deliver `signal` to `pid`.
pub fn send_signal(pid: i32, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
