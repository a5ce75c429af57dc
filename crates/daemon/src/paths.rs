//! Filesystem layout under the per-user base directory (`~/.tabs`).

use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

const BASE_DIR_NAME: &str = ".tabs";

pub fn base_dir() -> io::Result<PathBuf> {
    let home = std::env::var("HOME")
        .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "HOME is not set"))?;
    Ok(PathBuf::from(home).join(BASE_DIR_NAME))
}

/// Resolve the base directory and create it (plus `state/` and `sessions/`)
/// with 0700 permissions.
pub fn ensure_base_dir() -> io::Result<PathBuf> {
    let base = base_dir()?;
    ensure_layout(&base)?;
    Ok(base)
}

pub fn ensure_layout(base: &Path) -> io::Result<()> {
    mkdir_private(base)?;
    mkdir_private(&state_dir(base))?;
    mkdir_private(&sessions_dir(base))?;
    Ok(())
}

fn mkdir_private(path: &Path) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(0o700).create(path)
}

pub fn socket_path(base: &Path) -> PathBuf {
    base.join("daemon.sock")
}

pub fn pid_path(base: &Path) -> PathBuf {
    base.join("daemon.pid")
}

pub fn lock_path(base: &Path) -> PathBuf {
    base.join("daemon.lock")
}

pub fn log_path(base: &Path) -> PathBuf {
    base.join("daemon.log")
}

pub fn state_dir(base: &Path) -> PathBuf {
    base.join("state")
}

pub fn sessions_dir(base: &Path) -> PathBuf {
    base.join("sessions")
}
