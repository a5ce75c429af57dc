//! Single-instance guard: pid file for liveness probing, lock file whose
//! exclusive-create semantic is the actual mutex.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::{DaemonError, Result, paths};

pub struct PidLock {
    pid_path: PathBuf,
    lock_path: PathBuf,
}

impl PidLock {
    /// Acquire the daemon pid+lock pair, refusing when another live daemon
    /// owns it and clearing stale files left by a dead one.
    pub fn acquire(base: &Path) -> Result<Self> {
        let pid_path = paths::pid_path(base);
        let lock_path = paths::lock_path(base);

        cleanup_stale(&pid_path, &lock_path)?;

        let mut lock_file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&lock_path)
            .map_err(|err| {
                DaemonError::Storage(format!("acquire daemon lock: {}", err))
            })?;
        lock_file.flush()?;
        drop(lock_file);

        let pid = std::process::id();
        if let Err(err) = fs::write(&pid_path, format!("{}\n", pid)) {
            let _ = fs::remove_file(&lock_path);
            return Err(DaemonError::Storage(format!("write pid file: {}", err)));
        }

        Ok(Self {
            pid_path,
            lock_path,
        })
    }

    /// Remove both files, tolerating ones already gone.
    pub fn release(&self) -> io::Result<()> {
        remove_if_exists(&self.pid_path)?;
        remove_if_exists(&self.lock_path)?;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn cleanup_stale(pid_path: &Path, lock_path: &Path) -> Result<()> {
    let data = match fs::read_to_string(pid_path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let _ = fs::remove_file(lock_path);
            return Ok(());
        }
        Err(err) => {
            return Err(DaemonError::Storage(format!("read pid file: {}", err)));
        }
    };

    match data.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => {
            if process_alive(pid) {
                return Err(DaemonError::AlreadyRunning(pid));
            }
            let _ = fs::remove_file(pid_path);
            let _ = fs::remove_file(lock_path);
            Ok(())
        }
        _ => {
            // Unparseable pid file: treat as stale.
            let _ = fs::remove_file(pid_path);
            Ok(())
        }
    }
}

/// Probe a pid with signal 0. EPERM means the process exists but is owned
/// by someone else, so it counts as alive.
pub fn process_alive(pid: i32) -> bool {
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    matches!(
        io::Error::last_os_error().raw_os_error(),
        Some(libc::EPERM)
    )
}

/// Read the recorded daemon pid, if any.
pub fn pid_from_file(base: &Path) -> io::Result<i32> {
    let data = fs::read_to_string(paths::pid_path(base))?;
    data.trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid pid file"))
}
