//! Event handler for agent CLI hooks.
//!
//! Reads one hook payload from stdin, converts it into an `EventRecord`,
//! and hands it to the daemon. Bad input is logged and dropped; only an
//! unreachable daemon is reported back as a failure.

use agent_monitor_protocol::{EventKind, EventRecord};
use chrono::Utc;
use serde::Deserialize;
use std::env;
use std::io::{self, Read};

use crate::daemon_client;
use crate::error::HookError;

const TTY_ENV: &str = "AGENT_MONITOR_TTY";

/// Hook payload as written by the agent CLI. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct HookInput {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub hook_event_name: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub is_interrupt: bool,
    #[serde(default)]
    pub tool_name: Option<String>,
}

impl HookInput {
    pub fn event_kind(&self) -> EventKind {
        self.hook_event_name
            .as_deref()
            .map(EventKind::from_hook_name)
            .unwrap_or(EventKind::Unknown)
    }

    /// Builds the record for the daemon. `None` for callbacks the daemon
    /// does not track.
    pub fn to_event(&self, terminal: Option<String>) -> Option<EventRecord> {
        let kind = self.event_kind();
        if kind == EventKind::Unknown {
            return None;
        }

        let mut event = EventRecord::new(
            self.session_id.clone().unwrap_or_default(),
            kind,
            Utc::now(),
        );
        event.working_directory = self.cwd.clone();
        event.transcript_reference = self.transcript_path.clone();
        event.user_prompt_text = self.prompt.clone();
        event.notification_kind = self.notification_type.clone();
        event.notification_message = self.message.clone();
        event.agent_id = self.agent_id.clone();
        event.agent_display_name = self.agent_name.clone();
        event.agent_type = self.agent_type.clone();
        event.is_interrupted = self.is_interrupt;
        event.tool_name = self.tool_name.clone();
        event.terminal_identifier = terminal;
        Some(event)
    }
}

pub fn run() -> Result<(), HookError> {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;

    if input.trim().is_empty() {
        tracing::debug!("Empty hook input");
        return Ok(());
    }

    let hook_input: HookInput = match serde_json::from_str(&input) {
        Ok(hook_input) => hook_input,
        Err(err) => {
            tracing::warn!(error = %err, "Failed to parse hook input");
            return Ok(());
        }
    };

    handle_hook_input(&hook_input, terminal_identifier())
}

fn handle_hook_input(hook_input: &HookInput, terminal: Option<String>) -> Result<(), HookError> {
    let Some(event) = hook_input.to_event(terminal) else {
        tracing::debug!(
            event = ?hook_input.hook_event_name,
            "Skipping untracked hook event"
        );
        return Ok(());
    };

    if let Err(err) = event.validate() {
        tracing::debug!(
            event = ?hook_input.hook_event_name,
            code = %err.code,
            "Skipping event (invalid session_id)"
        );
        return Ok(());
    }

    let session_id = event.session_id.clone();
    let event_kind = event.event_kind;
    match daemon_client::send_event(event) {
        Ok(accepted) => {
            tracing::debug!(
                session = %session_id,
                event_kind = event_kind.as_str(),
                accepted,
                "Daemon answered event"
            );
            Ok(())
        }
        Err(HookError::Disabled(var)) => {
            tracing::debug!(env = var, "Daemon disabled; dropping event");
            Ok(())
        }
        Err(err) if err.is_unreachable() => Err(err),
        Err(err) => {
            tracing::warn!(error = %err, session = %session_id, "Daemon did not take event");
            Ok(())
        }
    }
}

/// Terminal the agent CLI runs in: the env override, else whichever of the
/// standard streams is attached to a tty.
fn terminal_identifier() -> Option<String> {
    if let Ok(value) = env::var(TTY_ENV) {
        let value = value.trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO]
        .into_iter()
        .find_map(tty_name)
}

#[allow(unsafe_code)]
fn tty_name(fd: libc::c_int) -> Option<String> {
    // SAFETY: ttyname returns either null or a pointer to a NUL-terminated
    // static buffer; the string is copied out before any other libc call.
    unsafe {
        if libc::isatty(fd) != 1 {
            return None;
        }
        let name = libc::ttyname(fd);
        if name.is_null() {
            return None;
        }
        std::ffi::CStr::from_ptr(name)
            .to_str()
            .ok()
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> HookInput {
        serde_json::from_str(json).expect("hook input")
    }

    #[test]
    fn converts_all_hook_fields() {
        let input = parse(
            r#"{
                "session_id": "abc",
                "hook_event_name": "PostToolUseFailure",
                "cwd": "/repo",
                "transcript_path": "/tmp/t.jsonl",
                "prompt": "fix bug",
                "notification_type": "permission_prompt",
                "message": "Allow?",
                "agent_id": "a1",
                "agent_name": "explorer",
                "agent_type": "Explore",
                "is_interrupt": true,
                "tool_name": "Bash",
                "extra": {"ignored": true}
            }"#,
        );

        let event = input
            .to_event(Some("/dev/ttys004".to_string()))
            .expect("event");
        assert_eq!(event.session_id, "abc");
        assert_eq!(event.event_kind, EventKind::PostToolUseFailure);
        assert_eq!(event.working_directory.as_deref(), Some("/repo"));
        assert_eq!(event.transcript_reference.as_deref(), Some("/tmp/t.jsonl"));
        assert_eq!(event.user_prompt_text.as_deref(), Some("fix bug"));
        assert_eq!(event.notification_kind.as_deref(), Some("permission_prompt"));
        assert_eq!(event.notification_message.as_deref(), Some("Allow?"));
        assert_eq!(event.agent_id.as_deref(), Some("a1"));
        assert_eq!(event.agent_display_name.as_deref(), Some("explorer"));
        assert_eq!(event.agent_type.as_deref(), Some("Explore"));
        assert!(event.is_interrupted);
        assert_eq!(event.tool_name.as_deref(), Some("Bash"));
        assert_eq!(event.terminal_identifier.as_deref(), Some("/dev/ttys004"));
    }

    #[test]
    fn maps_every_tracked_hook_name() {
        for (name, kind) in [
            ("SessionStart", EventKind::SessionStart),
            ("UserPromptSubmit", EventKind::UserPromptSubmit),
            ("PreToolUse", EventKind::PreToolUse),
            ("PostToolUse", EventKind::PostToolUse),
            ("PostToolUseFailure", EventKind::PostToolUseFailure),
            ("SubagentStart", EventKind::SubagentStart),
            ("SubagentStop", EventKind::SubagentStop),
            ("Notification", EventKind::Notification),
            ("Stop", EventKind::Stop),
            ("SessionEnd", EventKind::SessionEnd),
        ] {
            let input = HookInput {
                session_id: Some("s".to_string()),
                hook_event_name: Some(name.to_string()),
                ..HookInput::default()
            };
            assert_eq!(input.to_event(None).map(|event| event.event_kind), Some(kind));
        }
    }

    #[test]
    fn untracked_hooks_produce_no_event() {
        let input = parse(r#"{"session_id": "s", "hook_event_name": "PreCompact"}"#);
        assert!(input.to_event(None).is_none());
        let input = parse(r#"{"session_id": "s"}"#);
        assert!(input.to_event(None).is_none());
    }

    #[test]
    fn missing_fields_default() {
        let input = parse(r#"{"hook_event_name": "Stop"}"#);
        let event = input.to_event(None).expect("event");
        assert_eq!(event.session_id, "");
        assert!(!event.is_interrupted);
        assert!(event.working_directory.is_none());
        assert!(event.validate().is_err());
    }

    #[test]
    fn invalid_session_is_dropped_without_contacting_daemon() {
        let input = parse(r#"{"session_id": "../etc", "hook_event_name": "Stop"}"#);
        assert!(handle_hook_input(&input, None).is_ok());
    }
}
