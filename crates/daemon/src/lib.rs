//! The tabs capture daemon.
//!
//! A single-instance background process bound to a unix socket under the
//! per-user base directory. Editor hooks deliver capture events over a
//! newline-delimited JSON protocol; the daemon tails external transcripts,
//! deduplicates, and appends normalized events to per-session append-only
//! logs with a sidecar cursor per session. A poll worker picks up Cursor
//! conversations from its state database, and a push handler uploads
//! finished sessions to the remote server.

pub mod claude;
pub mod cleanup;
pub mod cursor;
pub mod paths;
pub mod pid;
pub mod push;
pub mod server;
pub mod state;
pub mod writer;

pub use pid::PidLock;
pub use server::{Daemon, Request, Response, PROTOCOL_VERSION};
pub use state::Status;
pub use writer::{SessionCursor, SessionMetadata};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    InvalidPayload(String),
    #[error("{0}")]
    Storage(String),
    #[error("daemon already running (pid {0})")]
    AlreadyRunning(i32),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
