use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use tabs_daemon::{Daemon, DaemonError, PidLock, cleanup, cursor, paths};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("tabs-daemon: {}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), DaemonError> {
    let base_dir = paths::ensure_base_dir()?;

    let config_path = tabs_config::config_path()
        .map_err(|err| DaemonError::Storage(err.to_string()))?;
    let cfg = tabs_config::load_or_default(&config_path)
        .map_err(|err| DaemonError::Storage(err.to_string()))?;

    init_logging(&base_dir, &cfg.local.log_level)?;
    info!(version = env!("CARGO_PKG_VERSION"), "tabs-daemon starting");

    let pid_lock = PidLock::acquire(&base_dir)?;

    let daemon = Arc::new(Daemon::new(base_dir.clone(), config_path));
    let listener = match daemon.listen() {
        Ok(listener) => listener,
        Err(err) => {
            let _ = pid_lock.release();
            return Err(err.into());
        }
    };
    info!(socket = %daemon.socket_path().display(), "listening");

    if !cfg.cursor.db_path.trim().is_empty() {
        cursor::spawn_poller(
            Arc::clone(&daemon),
            cfg.cursor.db_path.clone(),
            cfg.cursor.poll_interval,
        );
    }
    cleanup::spawn_cleanup(Arc::clone(&daemon), cfg.local.empty_session_retention_hours);

    let result = daemon.run(listener).await;

    if let Err(err) = pid_lock.release() {
        info!(error = %err, "cleanup error");
    }
    info!("tabs-daemon stopped");
    result
}

fn init_logging(base_dir: &std::path::Path, log_level: &str) -> std::io::Result<()> {
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(paths::log_path(base_dir))?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Arc::new(log_file))
        .init();
    Ok(())
}
