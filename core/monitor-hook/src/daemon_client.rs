//! Client helper for talking to agent-monitor-daemon.
//!
//! The daemon is the only writer. Delivery failures are surfaced to the
//! caller; there is no local fallback.

use agent_monitor_protocol::{
    EventRecord, Method, Request, Response, SessionView, MAX_REQUEST_BYTES,
};
use chrono::Utc;
use rand::RngCore;
use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::HookError;

const ENABLE_ENV: &str = "AGENT_MONITOR_ENABLED";
const SOCKET_ENV: &str = "AGENT_MONITOR_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const MONITOR_DIR: &str = ".agent-monitor";
const READ_TIMEOUT_MS: u64 = 2000;
const WRITE_TIMEOUT_MS: u64 = 2000;
const RETRY_DELAY_MS: u64 = 50;

pub fn daemon_enabled() -> bool {
    match env::var(ENABLE_ENV) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => true,
    }
}

pub fn monitor_home() -> Result<PathBuf, HookError> {
    let home = dirs::home_dir().ok_or(HookError::HomeNotFound)?;
    Ok(home.join(MONITOR_DIR))
}

fn socket_path() -> Result<PathBuf, HookError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(monitor_home()?.join(SOCKET_NAME))
}

/// Delivers one event, retrying once. The retry carries the same
/// `event_id` so the daemon's log drops the duplicate if the first attempt
/// landed. Returns whether the daemon accepted the record.
pub fn send_event(mut event: EventRecord) -> Result<bool, HookError> {
    if !daemon_enabled() {
        return Err(HookError::Disabled(ENABLE_ENV));
    }
    if event.event_id.is_none() {
        event.event_id = Some(make_event_id(std::process::id()));
    }

    let build_request = || -> Result<Request, HookError> {
        Ok(Request::new(
            Method::Event,
            event.event_id.clone(),
            Some(serde_json::to_value(&event)?),
        ))
    };

    let response = send_with_retry(build_request, "session event")?;
    Ok(response
        .data
        .as_ref()
        .and_then(|data| data.get("accepted"))
        .and_then(|value| value.as_bool())
        .unwrap_or(false))
}

pub fn get_sessions() -> Result<Vec<SessionView>, HookError> {
    let response = ok_response(send_request(Request::new(
        Method::GetSessions,
        Some("sessions".to_string()),
        None,
    ))?)?;
    decode_sessions(response.data.unwrap_or_default())
}

pub fn dismiss_session(session_id: &str) -> Result<bool, HookError> {
    let response = ok_response(send_request(Request::new(
        Method::DismissSession,
        Some("dismiss".to_string()),
        Some(serde_json::json!({ "session_id": session_id })),
    ))?)?;
    Ok(response
        .data
        .as_ref()
        .and_then(|data| data.get("dismissed"))
        .and_then(|value| value.as_bool())
        .unwrap_or(false))
}

pub fn clear_sessions() -> Result<u64, HookError> {
    let response = ok_response(send_request(Request::new(
        Method::ClearSessions,
        Some("clear".to_string()),
        None,
    ))?)?;
    Ok(response
        .data
        .as_ref()
        .and_then(|data| data.get("cleared"))
        .and_then(|value| value.as_u64())
        .unwrap_or(0))
}

/// Streams snapshots to `on_snapshot` until the daemon closes the
/// connection or the callback returns false.
pub fn watch_sessions<F>(mut on_snapshot: F) -> Result<(), HookError>
where
    F: FnMut(Vec<SessionView>) -> bool,
{
    let socket = socket_path()?;
    let mut stream = connect(&socket)?;
    write_request(
        &mut stream,
        &Request::new(Method::WatchSessions, Some("watch".to_string()), None),
    )?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    read_line(&mut reader, &mut line)?;
    let initial: Response = serde_json::from_str(line.trim_end())
        .map_err(|err| HookError::InvalidResponse(err.to_string()))?;
    let initial = ok_response(initial)?;
    if !on_snapshot(decode_sessions(initial.data.unwrap_or_default())?) {
        return Ok(());
    }

    loop {
        line.clear();
        if read_line(&mut reader, &mut line)? == 0 {
            return Ok(());
        }
        let sessions: Vec<SessionView> = serde_json::from_str(line.trim_end())
            .map_err(|err| HookError::InvalidResponse(err.to_string()))?;
        if !on_snapshot(sessions) {
            return Ok(());
        }
    }
}

fn read_line(reader: &mut BufReader<UnixStream>, line: &mut String) -> Result<usize, HookError> {
    reader
        .read_line(line)
        .map_err(|err| HookError::Transport(format!("Failed to read stream: {}", err)))
}

fn decode_sessions(data: serde_json::Value) -> Result<Vec<SessionView>, HookError> {
    serde_json::from_value(data).map_err(|err| HookError::InvalidResponse(err.to_string()))
}

fn ok_response(response: Response) -> Result<Response, HookError> {
    if response.ok {
        return Ok(response);
    }
    Err(match response.error {
        Some(err) => HookError::Rejected {
            code: err.code,
            message: err.message,
        },
        None => HookError::InvalidResponse("Unknown daemon error".to_string()),
    })
}

fn send_with_retry<F>(build: F, label: &str) -> Result<Response, HookError>
where
    F: Fn() -> Result<Request, HookError>,
{
    match send_request(build()?).and_then(ok_response) {
        Ok(response) => Ok(response),
        Err(err) => {
            tracing::warn!(error = %err, "Failed to send {} to daemon", label);
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send_request(build()?)
                .and_then(ok_response)
                .map_err(|retry_err| {
                    tracing::warn!(
                        error = %retry_err,
                        "Retry failed sending {} to daemon",
                        label
                    );
                    retry_err
                })
        }
    }
}

fn connect(socket: &Path) -> Result<UnixStream, HookError> {
    let stream = UnixStream::connect(socket).map_err(|err| HookError::Unreachable {
        path: socket.to_path_buf(),
        details: err.to_string(),
    })?;
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
    Ok(stream)
}

fn write_request(stream: &mut UnixStream, request: &Request) -> Result<(), HookError> {
    let mut payload = serde_json::to_vec(request)?;
    payload.push(b'\n');
    stream
        .write_all(&payload)
        .map_err(|err| HookError::Transport(format!("Failed to write request: {}", err)))?;
    stream.flush().ok();
    Ok(())
}

fn send_request(request: Request) -> Result<Response, HookError> {
    let socket = socket_path()?;
    let mut stream = connect(&socket)?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));

    write_request(&mut stream, &request)?;
    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, HookError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(HookError::InvalidResponse(
                        "Response exceeded maximum size".to_string(),
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
                return Err(HookError::Transport(
                    "Timed out waiting for daemon response".to_string(),
                ));
            }
            Err(err) => {
                return Err(HookError::Transport(format!(
                    "Failed to read response: {}",
                    err
                )))
            }
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err(HookError::InvalidResponse(
            "Daemon response was empty".to_string(),
        ));
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| HookError::InvalidResponse(format!("Failed to parse response JSON: {}", err)))
}

fn make_event_id(pid: u32) -> String {
    let mut random = rand::thread_rng();
    let rand = random.next_u64();
    format!("evt-{}-{}-{:x}", Utc::now().timestamp_millis(), pid, rand)
}
