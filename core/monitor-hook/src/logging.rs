//! File logging for the hook.
//!
//! The hook runs inside the agent CLI's hook pipeline, so it must never
//! write to stdout/stderr there. Logs go to a daily file under
//! `~/.agent-monitor/logs/`.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::daemon_client::monitor_home;

const LOG_FILE_PREFIX: &str = "hook.log";
const DEBUG_LOG_ENV: &str = "AGENT_MONITOR_DEBUG_LOG";

/// Installs the global subscriber. The returned guard flushes pending lines
/// on drop and must live until the process exits.
pub fn init() -> Option<WorkerGuard> {
    let log_dir = monitor_home().ok()?.join("logs");
    fs_err::create_dir_all(&log_dir).ok()?;

    let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let debug_enabled = std::env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;

    Some(guard)
}
