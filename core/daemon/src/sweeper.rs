//! Staleness sweeper.
//!
//! Producers crash and stop events get lost, so a periodic pass demotes
//! sessions and agents that have gone quiet. Demotion only ever moves toward
//! Idle/Completed; nothing here promotes.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use agent_monitor_protocol::{AgentStatus, SessionStatus};
use chrono::{DateTime, Utc};

use crate::reducer::SessionRecord;
use crate::state::SharedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleThresholds {
    /// Active session with no event for this long becomes Idle.
    pub session_stale: chrono::Duration,
    /// Active agent older than this is force-completed.
    pub agent_stale: chrono::Duration,
    /// Completed agent is dropped this long after it completed.
    pub agent_remove: chrono::Duration,
    /// SessionEnd markers are forgotten after this long.
    pub tombstone_ttl: chrono::Duration,
}

impl Default for StaleThresholds {
    fn default() -> Self {
        Self {
            session_stale: chrono::Duration::seconds(30),
            agent_stale: chrono::Duration::seconds(120),
            agent_remove: chrono::Duration::seconds(15),
            tombstone_ttl: chrono::Duration::hours(24),
        }
    }
}

/// Applies the demotion rules to one session. Returns true if anything changed.
pub fn sweep_session(
    session: &mut SessionRecord,
    now: DateTime<Utc>,
    thresholds: &StaleThresholds,
) -> bool {
    let mut changed = false;

    if session.status == SessionStatus::Active
        && now.signed_duration_since(session.last_updated_at) > thresholds.session_stale
    {
        tracing::debug!(session_id = %session.session_id, "Session went idle (stale)");
        session.status = SessionStatus::Idle;
        changed = true;
    }

    for agent in session.agents.values_mut() {
        if agent.status == AgentStatus::Active
            && now.signed_duration_since(agent.created_at) > thresholds.agent_stale
        {
            tracing::debug!(
                session_id = %session.session_id,
                agent_id = %agent.agent_id,
                "Agent force-completed (stale)"
            );
            agent.complete(now);
            changed = true;
        }
    }

    let before = session.agents.len();
    session.agents.retain(|_, agent| {
        agent.status != AgentStatus::Completed
            || now.signed_duration_since(agent.last_updated_at) <= thresholds.agent_remove
    });
    changed || session.agents.len() != before
}

pub fn spawn_sweeper(state: Arc<SharedState>, interval: Duration) {
    thread::spawn(move || loop {
        thread::sleep(interval);
        if state.maintain(Utc::now()) {
            tracing::debug!(generation = state.generation(), "Sweep demoted stale state");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_monitor_protocol::{EventKind, EventRecord};
    use crate::reducer::{reduce_session, PermissionClassifier, SessionUpdate};
    use chrono::Duration as ChronoDuration;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-31T00:00:00Z")
            .expect("parse")
            .with_timezone(&Utc)
            + ChronoDuration::seconds(offset_secs)
    }

    fn session_with_agent(status: SessionStatus) -> SessionRecord {
        let mut start = EventRecord::new("session-1", EventKind::SubagentStart, ts(0));
        start.agent_id = Some("a1".to_string());
        let mut record = match reduce_session(None, &start, &PermissionClassifier::default()) {
            SessionUpdate::Upsert(record) => record,
            other => panic!("expected upsert, got {:?}", other),
        };
        record.status = status;
        record
    }

    #[test]
    fn fresh_session_is_untouched() {
        let mut session = session_with_agent(SessionStatus::Active);
        assert!(!sweep_session(&mut session, ts(30), &StaleThresholds::default()));
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[test]
    fn stale_active_session_goes_idle() {
        let mut session = session_with_agent(SessionStatus::Active);
        assert!(sweep_session(&mut session, ts(31), &StaleThresholds::default()));
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.agents["a1"].status, AgentStatus::Active);
    }

    #[test]
    fn waiting_sessions_are_not_demoted() {
        for status in [
            SessionStatus::WaitingForInput,
            SessionStatus::NeedsPermission,
            SessionStatus::Idle,
            SessionStatus::Completed,
        ] {
            let mut session = session_with_agent(status);
            session.agents.clear();
            assert!(!sweep_session(&mut session, ts(3600), &StaleThresholds::default()));
            assert_eq!(session.status, status);
        }
    }

    #[test]
    fn stale_agent_is_completed_then_removed() {
        let thresholds = StaleThresholds::default();
        let mut session = session_with_agent(SessionStatus::Idle);

        assert!(sweep_session(&mut session, ts(121), &thresholds));
        let agent = &session.agents["a1"];
        assert_eq!(agent.status, AgentStatus::Completed);
        assert_eq!(agent.stopped_at, Some(ts(121)));

        assert!(!sweep_session(&mut session, ts(136), &thresholds));
        assert_eq!(session.agents.len(), 1);

        assert!(sweep_session(&mut session, ts(137), &thresholds));
        assert!(session.agents.is_empty());
    }

    #[test]
    fn sweeping_never_reactivates() {
        let thresholds = StaleThresholds::default();
        let mut session = session_with_agent(SessionStatus::Idle);
        session
            .agents
            .get_mut("a1")
            .expect("agent")
            .complete(ts(1));

        for offset in [0, 5, 10, 15] {
            sweep_session(&mut session, ts(offset), &thresholds);
            assert_eq!(session.status, SessionStatus::Idle);
            if let Some(agent) = session.agents.get("a1") {
                assert_eq!(agent.status, AgentStatus::Completed);
            }
        }
    }
}
