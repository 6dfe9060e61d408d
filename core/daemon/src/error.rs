//! Startup errors for the daemon.
//!
//! Data-quality problems never surface as errors; only failures that keep
//! the daemon from starting end up here.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("Home directory not found")]
    HomeNotFound,

    #[error("Configuration file unreadable: {}: {source}", .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration file malformed: {}: {details}", .path.display())]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Socket setup failed: {}: {details}", .path.display())]
    Socket { path: PathBuf, details: String },

    #[error("Event log unavailable: {0}")]
    EventLog(String),
}
