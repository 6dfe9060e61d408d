//! Pure event → session reducer.
//!
//! `reduce_session` takes the current record (if any) and one event and
//! returns the record that should replace it. It never touches shared state;
//! the store decides what to do with the result.
//!
//! ```text
//! SessionStart                 → active
//! UserPromptSubmit             → active
//! PreToolUse/PostToolUse       → active
//! PostToolUseFailure           → waiting_for_input (interrupted) | unchanged
//! SubagentStart                → active if idle/completed, else unchanged
//! SubagentStop                 → unchanged (agent completes)
//! Notification                 → needs_permission | waiting_for_input
//! Stop                         → idle if active, else unchanged
//! SessionEnd                   → removes session record
//! Unknown                      → unchanged
//! ```

use std::collections::HashMap;

use agent_monitor_protocol::{
    AgentStatus, AgentView, EventKind, EventRecord, SessionStatus, SessionView,
};
use chrono::{DateTime, Utc};

pub const PERMISSION_PROMPT_KIND: &str = "permission_prompt";
pub const DEFAULT_PERMISSION_KEYWORDS: &[&str] = &[
    "permission",
    "approve",
    "allow",
    "confirm",
    "unsafe",
    "dangerous",
    "trust",
    "grant",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub agent_id: String,
    pub display_name: Option<String>,
    pub agent_type: Option<String>,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl AgentRecord {
    fn started(key: &str, event: &EventRecord) -> Self {
        Self {
            agent_id: key.to_string(),
            display_name: non_empty(event.agent_display_name.as_ref()),
            agent_type: non_empty(event.agent_type.as_ref()),
            status: AgentStatus::Active,
            created_at: event.timestamp,
            last_updated_at: event.timestamp,
            stopped_at: None,
        }
    }

    pub fn complete(&mut self, at: DateTime<Utc>) {
        self.status = AgentStatus::Completed;
        self.stopped_at = Some(at);
        self.last_updated_at = at;
    }

    pub fn to_view(&self) -> AgentView {
        AgentView {
            agent_id: self.agent_id.clone(),
            display_name: self.display_name.clone(),
            agent_type: self.agent_type.clone(),
            status: self.status,
            created_at: self.created_at,
            last_updated_at: self.last_updated_at,
            stopped_at: self.stopped_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub status: SessionStatus,
    pub working_directory: Option<String>,
    pub transcript_reference: Option<String>,
    pub user_prompt_text: Option<String>,
    pub terminal_identifier: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub agents: HashMap<String, AgentRecord>,
    /// Insertion order, assigned by the store; breaks `created_at` ties.
    pub seq: u64,
}

impl SessionRecord {
    fn new(session_id: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            status: SessionStatus::Active,
            working_directory: None,
            transcript_reference: None,
            user_prompt_text: None,
            terminal_identifier: None,
            created_at,
            last_updated_at: created_at,
            agents: HashMap::new(),
            seq: 0,
        }
    }

    pub fn to_view(&self) -> SessionView {
        let mut agents: Vec<&AgentRecord> = self.agents.values().collect();
        agents.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });

        SessionView {
            session_id: self.session_id.clone(),
            status: self.status,
            working_directory: self.working_directory.clone(),
            transcript_reference: self.transcript_reference.clone(),
            user_prompt_text: self.user_prompt_text.clone(),
            terminal_identifier: self.terminal_identifier.clone(),
            created_at: self.created_at,
            last_updated_at: self.last_updated_at,
            agents: agents.into_iter().map(AgentRecord::to_view).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum SessionUpdate {
    Upsert(SessionRecord),
    Delete { session_id: String },
    Skip,
}

/// Decides whether a Notification is asking the user for permission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionClassifier {
    keywords: Vec<String>,
}

impl PermissionClassifier {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords = keywords
            .into_iter()
            .map(|keyword| keyword.as_ref().trim().to_lowercase())
            .filter(|keyword| !keyword.is_empty())
            .collect();
        Self { keywords }
    }

    pub fn is_permission_request(&self, kind: Option<&str>, message: Option<&str>) -> bool {
        if kind == Some(PERMISSION_PROMPT_KIND) {
            return true;
        }
        let Some(message) = message else {
            return false;
        };
        let message = message.to_lowercase();
        self.keywords
            .iter()
            .any(|keyword| message.contains(keyword.as_str()))
    }
}

impl Default for PermissionClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_PERMISSION_KEYWORDS)
    }
}

pub fn reduce_session(
    current: Option<&SessionRecord>,
    event: &EventRecord,
    classifier: &PermissionClassifier,
) -> SessionUpdate {
    if event.validate().is_err() {
        return SessionUpdate::Skip;
    }

    if event.event_kind == EventKind::SessionEnd {
        return match current {
            Some(record) => SessionUpdate::Delete {
                session_id: record.session_id.clone(),
            },
            None => SessionUpdate::Skip,
        };
    }

    let mut record = current
        .cloned()
        .unwrap_or_else(|| SessionRecord::new(&event.session_id, event.timestamp));

    merge_sticky_fields(&mut record, event);
    if event.timestamp > record.last_updated_at {
        record.last_updated_at = event.timestamp;
    }
    record.status = next_status(record.status, event, classifier);
    apply_agent_event(&mut record.agents, event);

    if current == Some(&record) {
        SessionUpdate::Skip
    } else {
        SessionUpdate::Upsert(record)
    }
}

/// The session status transition table. `current` is `Active` for a
/// session created by this very event.
pub fn next_status(
    current: SessionStatus,
    event: &EventRecord,
    classifier: &PermissionClassifier,
) -> SessionStatus {
    match event.event_kind {
        EventKind::SessionStart
        | EventKind::UserPromptSubmit
        | EventKind::PreToolUse
        | EventKind::PostToolUse => SessionStatus::Active,
        EventKind::PostToolUseFailure => {
            if event.is_interrupted {
                SessionStatus::WaitingForInput
            } else {
                current
            }
        }
        EventKind::SubagentStart => match current {
            SessionStatus::Idle | SessionStatus::Completed => SessionStatus::Active,
            other => other,
        },
        EventKind::SubagentStop => current,
        EventKind::Notification => {
            if classifier.is_permission_request(
                event.notification_kind.as_deref(),
                event.notification_message.as_deref(),
            ) {
                SessionStatus::NeedsPermission
            } else {
                SessionStatus::WaitingForInput
            }
        }
        EventKind::Stop => match current {
            SessionStatus::Active => SessionStatus::Idle,
            other => other,
        },
        EventKind::SessionEnd | EventKind::Unknown => current,
    }
}

// First non-empty value wins for every sticky field; empties never clear.
fn merge_sticky_fields(record: &mut SessionRecord, event: &EventRecord) {
    adopt_first(&mut record.working_directory, event.working_directory.as_ref());
    adopt_first(
        &mut record.transcript_reference,
        event.transcript_reference.as_ref(),
    );
    adopt_first(&mut record.user_prompt_text, event.user_prompt_text.as_ref());
    adopt_first(
        &mut record.terminal_identifier,
        event.terminal_identifier.as_ref(),
    );
}

fn adopt_first(field: &mut Option<String>, incoming: Option<&String>) {
    if field.as_deref().is_some_and(|value| !value.is_empty()) {
        return;
    }
    if let Some(value) = non_empty(incoming) {
        *field = Some(value);
    }
}

fn apply_agent_event(agents: &mut HashMap<String, AgentRecord>, event: &EventRecord) {
    let Some(key) = event.agent_key() else {
        return;
    };

    match event.event_kind {
        EventKind::SubagentStart => {
            agents.insert(key.to_string(), AgentRecord::started(key, event));
        }
        EventKind::SubagentStop => {
            if let Some(agent) = agents.get_mut(key) {
                agent.complete(event.timestamp);
            }
        }
        _ => {}
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty()).cloned()
}
