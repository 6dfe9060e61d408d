//! IPC protocol types and validation for agent-monitor-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests and to decode session snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_SESSION_ID_LEN: usize = 256;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Event,
    GetSessions,
    WatchSessions,
    DismissSession,
    ClearSessions,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, id: Option<String>, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// -----------------------------------------------------------------------------
// Event records
// -----------------------------------------------------------------------------

/// Lifecycle callbacks emitted by the agent CLI.
///
/// Names the daemon does not know decode to `Unknown` so that a newer
/// producer never breaks an older daemon.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    PostToolUseFailure,
    SubagentStart,
    SubagentStop,
    Notification,
    Stop,
    SessionEnd,
    #[serde(other)]
    Unknown,
}

impl EventKind {
    /// Maps a hook callback name (`"PreToolUse"`, ...) onto an event kind.
    pub fn from_hook_name(name: &str) -> Self {
        match name {
            "SessionStart" => EventKind::SessionStart,
            "UserPromptSubmit" => EventKind::UserPromptSubmit,
            "PreToolUse" => EventKind::PreToolUse,
            "PostToolUse" => EventKind::PostToolUse,
            "PostToolUseFailure" => EventKind::PostToolUseFailure,
            "SubagentStart" => EventKind::SubagentStart,
            "SubagentStop" => EventKind::SubagentStop,
            "Notification" => EventKind::Notification,
            "Stop" => EventKind::Stop,
            "SessionEnd" => EventKind::SessionEnd,
            _ => EventKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionStart => "session_start",
            EventKind::UserPromptSubmit => "user_prompt_submit",
            EventKind::PreToolUse => "pre_tool_use",
            EventKind::PostToolUse => "post_tool_use",
            EventKind::PostToolUseFailure => "post_tool_use_failure",
            EventKind::SubagentStart => "subagent_start",
            EventKind::SubagentStop => "subagent_stop",
            EventKind::Notification => "notification",
            EventKind::Stop => "stop",
            EventKind::SessionEnd => "session_end",
            EventKind::Unknown => "unknown",
        }
    }
}

/// One lifecycle notification as delivered to the daemon.
///
/// Every field except `event_kind` is optional on the wire. Missing strings
/// decode as `None`, missing flags as `false`, and a missing timestamp as the
/// time of receipt. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EventRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub session_id: String,
    pub event_kind: EventKind,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_prompt_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub is_interrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl EventRecord {
    /// A bare record with every optional field unset.
    pub fn new(session_id: impl Into<String>, event_kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_id: None,
            session_id: session_id.into(),
            event_kind,
            timestamp,
            working_directory: None,
            transcript_reference: None,
            user_prompt_text: None,
            notification_kind: None,
            notification_message: None,
            agent_id: None,
            agent_display_name: None,
            agent_type: None,
            is_interrupted: false,
            terminal_identifier: None,
            tool_name: None,
        }
    }

    /// Key identifying a sub-agent within its session: `agent_id`, falling
    /// back to `agent_display_name`.
    pub fn agent_key(&self) -> Option<&str> {
        non_empty(self.agent_id.as_deref()).or_else(|| non_empty(self.agent_display_name.as_deref()))
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        validate_session_id(&self.session_id)
    }
}

/// Rejects ids that are empty or unsafe to use as a storage key.
pub fn validate_session_id(session_id: &str) -> Result<(), ErrorInfo> {
    if session_id.trim().is_empty() {
        return Err(ErrorInfo::new("missing_field", "session_id is required"));
    }
    if session_id.len() > MAX_SESSION_ID_LEN {
        return Err(ErrorInfo::new(
            "invalid_session_id",
            format!("session_id must be {} bytes or fewer", MAX_SESSION_ID_LEN),
        ));
    }
    if session_id.starts_with('.') {
        return Err(ErrorInfo::new(
            "invalid_session_id",
            "session_id must not start with '.'",
        ));
    }
    if session_id.contains(['/', '\\', '\0']) {
        return Err(ErrorInfo::new(
            "invalid_session_id",
            "session_id must not contain path separators",
        ));
    }
    Ok(())
}

pub fn parse_event(params: Value) -> Result<EventRecord, ErrorInfo> {
    let record: EventRecord = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("event payload is invalid: {}", err),
        )
    })?;
    record.validate()?;
    Ok(record)
}

/// Extracts the `session_id` parameter of `dismiss_session`.
pub fn parse_session_id_param(params: Option<Value>) -> Result<String, ErrorInfo> {
    let session_id = params
        .as_ref()
        .and_then(|params| params.get("session_id"))
        .and_then(|value| value.as_str())
        .ok_or_else(|| ErrorInfo::new("invalid_params", "session_id is required"))?;
    validate_session_id(session_id)?;
    Ok(session_id.to_string())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

// -----------------------------------------------------------------------------
// Snapshot views
// -----------------------------------------------------------------------------

const TITLE_MAX_CHARS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    WaitingForInput,
    NeedsPermission,
    Idle,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::WaitingForInput => "waiting_for_input",
            SessionStatus::NeedsPermission => "needs_permission",
            SessionStatus::Idle => "idle",
            SessionStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentView {
    pub agent_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub transcript_reference: Option<String>,
    #[serde(default)]
    pub user_prompt_text: Option<String>,
    #[serde(default)]
    pub terminal_identifier: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub agents: Vec<AgentView>,
}

impl SessionView {
    /// Short label for a dashboard row: the prompt, else the last two path
    /// components of the working directory, else the id prefix.
    pub fn title(&self) -> String {
        if let Some(prompt) = non_empty(self.user_prompt_text.as_deref()) {
            let mut chars = prompt.chars();
            let head: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
            return if chars.next().is_some() {
                format!("{}…", head)
            } else {
                head
            };
        }

        if let Some(cwd) = non_empty(self.working_directory.as_deref()) {
            let parts: Vec<&str> = cwd.split('/').filter(|part| !part.is_empty()).collect();
            return match parts.as_slice() {
                [] => "/".to_string(),
                [only] => (*only).to_string(),
                [.., parent, base] => format!("{}/{}", parent, base),
            };
        }

        self.session_id.chars().take(8).collect()
    }

    /// Distinct types of agents that have not completed, sorted.
    pub fn active_agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .agents
            .iter()
            .filter(|agent| agent.status != AgentStatus::Completed)
            .filter_map(|agent| non_empty(agent.agent_type.as_deref()))
            .map(str::to_string)
            .collect();
        types.sort();
        types.dedup();
        types
    }
}
