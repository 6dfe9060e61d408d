//! agent-monitor daemon entrypoint.
//!
//! A single-writer service that folds agent CLI lifecycle events into live
//! session state: a socket listener, strict request validation, an in-memory
//! store with a staleness sweeper, and a SQLite event log for restarts.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use agent_monitor_protocol::{
    parse_event, parse_session_id_param, ErrorInfo, Method, Request, Response, SessionView,
    MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

mod config;
mod db;
mod error;
mod notifier;
mod reducer;
mod replay;
mod state;
mod store;
mod sweeper;

use db::Db;
use error::DaemonError;
use state::SharedState;
use store::SessionStore;

const SOCKET_NAME: &str = "daemon.sock";
const SOCKET_ENV: &str = "AGENT_MONITOR_SOCKET";
const DEBUG_LOG_ENV: &str = "AGENT_MONITOR_DEBUG_LOG";
const READ_TIMEOUT_SECS: u64 = 2;
const WRITE_TIMEOUT_SECS: u64 = 5;
const READ_CHUNK_SIZE: usize = 4096;
const WATCH_IDLE_POLL_MS: u64 = 500;
const PEER_PROBE_TIMEOUT_MS: u64 = 10;

fn main() {
    init_logging();

    if let Err(err) = run() {
        error!(error = %err, "Daemon failed to start");
        std::process::exit(1);
    }
}

fn run() -> Result<(), DaemonError> {
    let config = config::load_config(None)?;
    let socket_path = daemon_socket_path()?;

    prepare_socket_dir(&socket_path)?;
    remove_existing_socket(&socket_path)?;

    let listener = UnixListener::bind(&socket_path).map_err(|err| DaemonError::Socket {
        path: socket_path.clone(),
        details: format!("Failed to bind daemon socket: {}", err),
    })?;

    let db = Db::new(daemon_db_path()?).map_err(DaemonError::EventLog)?;
    let store = Arc::new(SessionStore::new(config.classifier(), config.thresholds()));
    let shared_state = Arc::new(SharedState::new(db, store, config.retention_hours()));

    sweeper::spawn_sweeper(Arc::clone(&shared_state), config.sweep_interval());

    info!(
        path = %socket_path.display(),
        sessions = shared_state.session_count(),
        session_stale_secs = config.session_stale_secs,
        agent_stale_secs = config.agent_stale_secs,
        agent_remove_secs = config.agent_remove_secs,
        sweep_interval_secs = config.sweep_interval().as_secs(),
        "agent-monitor daemon started"
    );

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(|| handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }

    Ok(())
}

fn init_logging() {
    let debug_enabled = env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn daemon_socket_path() -> Result<PathBuf, DaemonError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(config::monitor_home()?.join(SOCKET_NAME))
}

fn daemon_db_path() -> Result<PathBuf, DaemonError> {
    Ok(config::monitor_home()?.join("daemon").join("events.db"))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), DaemonError> {
    let parent = socket_path.parent().ok_or_else(|| DaemonError::Socket {
        path: socket_path.to_path_buf(),
        details: "Socket path has no parent".to_string(),
    })?;
    fs::create_dir_all(parent).map_err(|err| DaemonError::Socket {
        path: socket_path.to_path_buf(),
        details: format!("Failed to create socket directory: {}", err),
    })
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), DaemonError> {
    if socket_path.exists() {
        fs::remove_file(socket_path).map_err(|err| DaemonError::Socket {
            path: socket_path.to_path_buf(),
            details: format!("Failed to remove existing socket: {}", err),
        })?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<SharedState>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");

    if request.protocol_version == PROTOCOL_VERSION && request.method == Method::WatchSessions {
        watch_sessions(stream, request.id, state);
        return;
    }

    let response = handle_request(request, state);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let request_bytes = match newline_index {
        Some(index) => {
            if buffer.len() > index + 1 {
                let trailing = &buffer[index + 1..];
                if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
                    warn!("Extra bytes detected after newline; ignoring trailing data");
                }
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: Arc<SharedState>) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => Response::ok(
            request.id,
            serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "sessions": state.session_count(),
                "generation": state.generation(),
                "watchers": state.watcher_count(),
                "logged_events": state.logged_event_count(),
            }),
        ),
        Method::Event => handle_event(request, state),
        Method::GetSessions => {
            let sessions = state.sessions_snapshot();
            tracing::debug!(sessions = sessions.len(), "Sessions snapshot");
            sessions_response(request.id, &sessions)
        }
        // Streamed by handle_connection before dispatch.
        Method::WatchSessions => Response::error(
            request.id,
            "invalid_request",
            "watch_sessions must be the only request on its connection",
        ),
        Method::DismissSession => {
            let session_id = match parse_session_id_param(request.params) {
                Ok(session_id) => session_id,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            let dismissed = state.dismiss_session(&session_id);
            Response::ok(request.id, serde_json::json!({ "dismissed": dismissed }))
        }
        Method::ClearSessions => {
            let cleared = state.clear_sessions();
            Response::ok(request.id, serde_json::json!({ "cleared": cleared }))
        }
    }
}

fn handle_event(request: Request, state: Arc<SharedState>) -> Response {
    let Some(params) = request.params else {
        tracing::debug!("Event request without payload");
        return Response::ok(request.id, serde_json::json!({ "accepted": false }));
    };

    let accepted = match parse_event(params) {
        Ok(event) => state.update_from_event(&event),
        Err(err) => {
            tracing::debug!(code = %err.code, message = %err.message, "Event rejected");
            false
        }
    };

    Response::ok(request.id, serde_json::json!({ "accepted": accepted }))
}

fn sessions_response(id: Option<String>, sessions: &[SessionView]) -> Response {
    match serde_json::to_value(sessions) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize sessions: {}", err),
        ),
    }
}

/// Sends the current snapshot, then a fresh snapshot line after every
/// change until the client goes away.
fn watch_sessions(mut stream: UnixStream, id: Option<String>, state: Arc<SharedState>) {
    let _ = stream.set_write_timeout(Some(Duration::from_secs(WRITE_TIMEOUT_SECS)));
    let rx = state.subscribe();

    let initial = state.sessions_snapshot();
    if write_response(&mut stream, sessions_response(id, &initial)).is_err() {
        return;
    }
    info!(watchers = state.watcher_count(), "Session watcher attached");

    loop {
        match rx.recv_timeout(Duration::from_millis(WATCH_IDLE_POLL_MS)) {
            Ok(signal) => {
                let latest = notifier::coalesce(&rx, signal);
                let sessions = state.sessions_snapshot();
                tracing::trace!(
                    generation = latest.generation,
                    sessions = sessions.len(),
                    "Watch update"
                );
                if let Err(err) = write_line(&mut stream, &sessions) {
                    tracing::debug!(error = %err, "Session watcher detached");
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if peer_closed(&mut stream) {
                    tracing::debug!("Session watcher closed its connection");
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Watch clients never send after their request, so a read that reports EOF
/// (or fails outright) means the client is gone.
fn peer_closed(stream: &mut UnixStream) -> bool {
    let _ = stream.set_read_timeout(Some(Duration::from_millis(PEER_PROBE_TIMEOUT_MS)));
    let mut byte = [0u8; 1];
    match stream.read(&mut byte) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) => !matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
        ),
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    write_line(stream, &response)
}

fn write_line<T: serde::Serialize>(stream: &mut UnixStream, value: &T) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, value)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
