//! In-memory session state store.
//!
//! The store is the single owner of session state. Every mutation (event
//! application, sweeps, operator removals) takes the write lock, so updates
//! for a session are applied one at a time against the latest state.
//! Snapshots take the read lock and hand back owned copies.
//!
//! A SessionEnd leaves a tombstone behind so that late, out-of-order events
//! for the ended session cannot resurrect it. Only a fresh SessionStart
//! clears the tombstone. The tombstone is recorded even when the session
//! is unknown: hook processes race, so the end can land before the events
//! that preceded it, and those must not open a session that already ended.
//! Nothing observable changes in that case.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use agent_monitor_protocol::{EventKind, EventRecord, SessionView};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::notifier::{ChangeNotifier, Subscription};
use crate::reducer::{reduce_session, PermissionClassifier, SessionRecord, SessionUpdate};
use crate::sweeper::{sweep_session, StaleThresholds};

/// What `apply` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Changed,
    Unchanged,
    /// Invalid record, or a straggler for an ended session.
    Rejected,
}

#[derive(Debug, Default)]
struct StoreInner {
    sessions: HashMap<String, SessionRecord>,
    tombstones: HashMap<String, DateTime<Utc>>,
    next_seq: u64,
}

impl StoreInner {
    fn apply(&mut self, event: &EventRecord, classifier: &PermissionClassifier) -> ApplyOutcome {
        let session_id = event.session_id.as_str();

        match event.event_kind {
            EventKind::SessionStart => {
                if self.tombstones.remove(session_id).is_some() {
                    debug!(session_id, "Clearing tombstone on SessionStart");
                }
            }
            EventKind::SessionEnd => {
                self.tombstones
                    .insert(session_id.to_string(), event.timestamp);
            }
            _ if self.tombstones.contains_key(session_id) => {
                debug!(
                    session_id,
                    event_kind = event.event_kind.as_str(),
                    "Skipping event for ended session"
                );
                return ApplyOutcome::Rejected;
            }
            _ => {}
        }

        let current = self.sessions.get(session_id);
        let previous_status = current.map(|record| record.status);

        match reduce_session(current, event, classifier) {
            SessionUpdate::Upsert(mut record) => {
                if previous_status.is_none() {
                    record.seq = self.next_seq;
                    self.next_seq += 1;
                }
                if previous_status != Some(record.status) {
                    info!(
                        session_id = %record.session_id,
                        status = record.status.as_str(),
                        previous = previous_status.map(|status| status.as_str()),
                        event_kind = event.event_kind.as_str(),
                        "Session status changed"
                    );
                }
                self.sessions.insert(record.session_id.clone(), record);
                ApplyOutcome::Changed
            }
            SessionUpdate::Delete { session_id } => {
                info!(session_id = %session_id, "Session ended");
                self.sessions.remove(&session_id);
                ApplyOutcome::Changed
            }
            SessionUpdate::Skip => ApplyOutcome::Unchanged,
        }
    }
}

pub struct SessionStore {
    inner: RwLock<StoreInner>,
    notifier: ChangeNotifier,
    classifier: PermissionClassifier,
    thresholds: StaleThresholds,
}

impl SessionStore {
    pub fn new(classifier: PermissionClassifier, thresholds: StaleThresholds) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            notifier: ChangeNotifier::new(),
            classifier,
            thresholds,
        }
    }

    /// Applies one event. Invalid records are dropped without a trace beyond
    /// a debug log; observable changes publish exactly one notification.
    pub fn apply(&self, event: &EventRecord) -> ApplyOutcome {
        if let Err(err) = event.validate() {
            debug!(code = %err.code, message = %err.message, "Dropping invalid event");
            return ApplyOutcome::Rejected;
        }

        let outcome = self.write().apply(event, &self.classifier);
        if outcome == ApplyOutcome::Changed {
            self.notifier.publish();
        }
        outcome
    }

    /// Runs the staleness rules against every session. Returns true if any
    /// observable state changed.
    pub fn sweep(&self, now: DateTime<Utc>) -> bool {
        let changed = {
            let mut inner = self.write();
            let mut changed = false;
            for session in inner.sessions.values_mut() {
                changed |= sweep_session(session, now, &self.thresholds);
            }
            let ttl = self.thresholds.tombstone_ttl;
            inner
                .tombstones
                .retain(|_, ended_at| now.signed_duration_since(*ended_at) <= ttl);
            changed
        };

        if changed {
            self.notifier.publish();
        }
        changed
    }

    /// Sessions ordered by creation (oldest first), agents likewise.
    pub fn snapshot(&self) -> Vec<SessionView> {
        let inner = self.read();
        let mut records: Vec<&SessionRecord> = inner.sessions.values().collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        records.into_iter().map(SessionRecord::to_view).collect()
    }

    /// Operator removal of one session. Idempotent.
    pub fn dismiss(&self, session_id: &str) -> bool {
        let removed = self.write().sessions.remove(session_id).is_some();
        if removed {
            info!(session_id, "Session dismissed");
            self.notifier.publish();
        }
        removed
    }

    /// Operator reset. Returns how many sessions were removed.
    pub fn clear_all(&self) -> usize {
        let removed = {
            let mut inner = self.write();
            let removed = inner.sessions.len();
            inner.sessions.clear();
            inner.tombstones.clear();
            removed
        };
        if removed > 0 {
            info!(removed, "All sessions cleared");
            self.notifier.publish();
        }
        removed
    }

    pub fn subscribe(&self) -> Subscription {
        self.notifier.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.notifier.generation()
    }

    pub fn subscriber_count(&self) -> usize {
        self.notifier.subscriber_count()
    }

    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(PermissionClassifier::default(), StaleThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::ChangeSignal;
    use agent_monitor_protocol::{AgentStatus, SessionStatus};
    use chrono::Duration;
    use std::sync::Arc;
    use std::thread;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-31T00:00:00Z")
            .expect("parse")
            .with_timezone(&Utc)
            + Duration::seconds(offset_secs)
    }

    fn event(session_id: &str, kind: EventKind, offset_secs: i64) -> EventRecord {
        EventRecord::new(session_id, kind, ts(offset_secs))
    }

    fn agent_event(session_id: &str, kind: EventKind, agent_id: &str, offset_secs: i64) -> EventRecord {
        let mut event = event(session_id, kind, offset_secs);
        event.agent_id = Some(agent_id.to_string());
        event
    }

    fn session(store: &SessionStore, session_id: &str) -> Option<SessionView> {
        store
            .snapshot()
            .into_iter()
            .find(|view| view.session_id == session_id)
    }

    #[test]
    fn duplicate_subagent_start_keeps_one_agent() {
        let store = SessionStore::default();
        let mut first = agent_event("s1", EventKind::SubagentStart, "a", 0);
        first.agent_type = Some("Explore".to_string());
        let mut second = agent_event("s1", EventKind::SubagentStart, "a", 1);
        second.agent_type = Some("Bash".to_string());

        store.apply(&first);
        store.apply(&second);

        let view = session(&store, "s1").expect("session");
        assert_eq!(view.agents.len(), 1);
        assert_eq!(view.agents[0].agent_type.as_deref(), Some("Bash"));
    }

    #[test]
    fn subagent_stop_without_start_creates_no_agent() {
        let store = SessionStore::default();
        store.apply(&agent_event("s1", EventKind::SubagentStop, "ghost", 0));

        let view = session(&store, "s1").expect("session");
        assert!(view.agents.is_empty());
    }

    #[test]
    fn working_directory_is_first_non_empty_value() {
        let store = SessionStore::default();
        let dirs = [None, Some(""), Some("/first"), Some("/second"), Some(""), None];
        for (offset, dir) in dirs.into_iter().enumerate() {
            let mut event = event("s1", EventKind::PreToolUse, offset as i64);
            event.working_directory = dir.map(str::to_string);
            store.apply(&event);
        }

        let view = session(&store, "s1").expect("session");
        assert_eq!(view.working_directory.as_deref(), Some("/first"));
    }

    #[test]
    fn sessions_are_isolated() {
        let store = SessionStore::default();
        let mut start_b = event("b", EventKind::SessionStart, 0);
        start_b.working_directory = Some("/b".to_string());
        store.apply(&start_b);
        let before = session(&store, "b").expect("session b");

        let mut noise = event("a", EventKind::UserPromptSubmit, 5);
        noise.working_directory = Some("/a".to_string());
        noise.user_prompt_text = Some("hello".to_string());
        store.apply(&noise);
        store.apply(&agent_event("a", EventKind::SubagentStart, "x", 6));
        store.apply(&event("a", EventKind::Stop, 7));
        store.apply(&event("a", EventKind::SessionEnd, 8));

        assert_eq!(session(&store, "b"), Some(before));
    }

    #[test]
    fn session_end_is_final_until_restart() {
        let store = SessionStore::default();
        store.apply(&event("s1", EventKind::SessionStart, 0));
        store.apply(&agent_event("s1", EventKind::SubagentStart, "a", 1));
        store.apply(&event("s1", EventKind::SessionEnd, 2));
        assert!(session(&store, "s1").is_none());

        store.apply(&event("s1", EventKind::PreToolUse, 3));
        store.apply(&agent_event("s1", EventKind::SubagentStart, "b", 4));
        assert!(session(&store, "s1").is_none());

        store.apply(&event("s1", EventKind::SessionStart, 5));
        let view = session(&store, "s1").expect("recreated");
        assert_eq!(view.status, SessionStatus::Active);
        assert!(view.agents.is_empty());
    }

    #[test]
    fn end_to_end_scenario() {
        let store = SessionStore::default();
        let mut start = event("s1", EventKind::SessionStart, 0);
        start.working_directory = Some("/p".to_string());
        let mut prompt = event("s1", EventKind::UserPromptSubmit, 1);
        prompt.user_prompt_text = Some("fix bug".to_string());
        let mut agent_start = agent_event("s1", EventKind::SubagentStart, "a1", 4);
        agent_start.agent_type = Some("Explore".to_string());
        let mut notification = event("s1", EventKind::Notification, 7);
        notification.notification_kind = Some("permission_prompt".to_string());

        for event in [
            start,
            prompt,
            event("s1", EventKind::PreToolUse, 2),
            event("s1", EventKind::PostToolUse, 3),
            agent_start,
            agent_event("s1", EventKind::SubagentStop, "a1", 5),
            event("s1", EventKind::Stop, 6),
            notification,
        ] {
            store.apply(&event);
        }

        let view = session(&store, "s1").expect("session");
        assert_eq!(view.status, SessionStatus::NeedsPermission);
        assert_eq!(view.user_prompt_text.as_deref(), Some("fix bug"));
        assert_eq!(view.working_directory.as_deref(), Some("/p"));
        assert_eq!(view.agents.len(), 1);
        assert_eq!(view.agents[0].agent_id, "a1");
        assert_eq!(view.agents[0].status, AgentStatus::Completed);
    }

    #[test]
    fn keyword_notifications_classify() {
        let store = SessionStore::default();
        let mut risky = event("s1", EventKind::Notification, 0);
        risky.notification_kind = Some(String::new());
        risky.notification_message = Some("Please approve this dangerous change".to_string());
        store.apply(&risky);
        assert_eq!(
            session(&store, "s1").expect("s1").status,
            SessionStatus::NeedsPermission
        );

        let mut benign = event("s2", EventKind::Notification, 0);
        benign.notification_message = Some("Build succeeded".to_string());
        store.apply(&benign);
        assert_eq!(
            session(&store, "s2").expect("s2").status,
            SessionStatus::WaitingForInput
        );
    }

    #[test]
    fn invalid_session_ids_are_dropped_silently() {
        let store = SessionStore::default();
        let rx = store.subscribe();
        for bad in ["", "../x", ".hidden", "a/b"] {
            store.apply(&event(bad, EventKind::SessionStart, 0));
        }
        assert_eq!(store.len(), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(store.generation(), 0);
    }

    #[test]
    fn apply_notifies_once_per_change() {
        let store = SessionStore::default();
        let rx = store.subscribe();

        let mut start = event("s1", EventKind::SessionStart, 0);
        start.working_directory = Some("/p".to_string());
        start.terminal_identifier = Some("/dev/ttys001".to_string());
        store.apply(&start);
        assert_eq!(rx.try_recv(), Ok(ChangeSignal { generation: 1 }));
        assert!(rx.try_recv().is_err());

        // Same event again changes nothing observable.
        store.apply(&start);
        assert!(rx.try_recv().is_err());

        // SessionEnd for an unknown session is a no-op.
        store.apply(&event("nobody", EventKind::SessionEnd, 1));
        assert!(rx.try_recv().is_err());
        assert_eq!(store.generation(), 1);
    }

    #[test]
    fn snapshot_orders_sessions_by_creation() {
        let store = SessionStore::default();
        store.apply(&event("late", EventKind::SessionStart, 10));
        store.apply(&event("early", EventKind::SessionStart, 1));
        store.apply(&event("tie-first", EventKind::SessionStart, 5));
        store.apply(&event("tie-second", EventKind::SessionStart, 5));

        let ids: Vec<String> = store
            .snapshot()
            .into_iter()
            .map(|view| view.session_id)
            .collect();
        assert_eq!(ids, vec!["early", "tie-first", "tie-second", "late"]);
    }

    #[test]
    fn dismiss_is_idempotent() {
        let store = SessionStore::default();
        store.apply(&event("s1", EventKind::SessionStart, 0));
        let rx = store.subscribe();

        assert!(store.dismiss("s1"));
        assert!(!store.dismiss("s1"));
        assert!(session(&store, "s1").is_none());
        assert_eq!(rx.try_iter().count(), 1);

        // Dismissal is not a tombstone; the session can come back.
        store.apply(&event("s1", EventKind::PreToolUse, 1));
        assert!(session(&store, "s1").is_some());
    }

    #[test]
    fn clear_all_removes_everything() {
        let store = SessionStore::default();
        store.apply(&event("s1", EventKind::SessionStart, 0));
        store.apply(&event("s2", EventKind::SessionStart, 0));
        store.apply(&event("s3", EventKind::SessionEnd, 0));

        assert_eq!(store.clear_all(), 2);
        assert_eq!(store.clear_all(), 0);
        assert!(store.snapshot().is_empty());

        // Tombstones are gone too.
        store.apply(&event("s3", EventKind::PreToolUse, 1));
        assert!(session(&store, "s3").is_some());
    }

    #[test]
    fn sweep_demotes_and_notifies() {
        let store = SessionStore::default();
        store.apply(&event("s1", EventKind::PreToolUse, 0));
        store.apply(&event("s2", EventKind::Notification, 0));
        let rx = store.subscribe();

        assert!(!store.sweep(ts(30)));
        assert!(store.sweep(ts(31)));
        assert_eq!(rx.try_iter().count(), 1);

        assert_eq!(session(&store, "s1").expect("s1").status, SessionStatus::Idle);
        assert_eq!(
            session(&store, "s2").expect("s2").status,
            SessionStatus::WaitingForInput
        );
        assert!(!store.sweep(ts(3600)));
    }

    #[test]
    fn session_end_before_other_events_blocks_them() {
        let store = SessionStore::default();
        let rx = store.subscribe();

        assert_eq!(
            store.apply(&event("s1", EventKind::SessionEnd, 5)),
            ApplyOutcome::Unchanged
        );
        assert!(rx.try_recv().is_err());

        assert_eq!(
            store.apply(&event("s1", EventKind::PreToolUse, 3)),
            ApplyOutcome::Rejected
        );
        assert!(session(&store, "s1").is_none());
        assert!(rx.try_recv().is_err());

        assert_eq!(
            store.apply(&event("s1", EventKind::SessionStart, 6)),
            ApplyOutcome::Changed
        );
        assert!(session(&store, "s1").is_some());
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn sweep_expires_tombstones() {
        let store = SessionStore::default();
        store.apply(&event("s1", EventKind::SessionEnd, 0));
        store.apply(&event("s1", EventKind::PreToolUse, 1));
        assert!(session(&store, "s1").is_none());

        store.sweep(ts(0) + Duration::hours(25));
        store.apply(&event("s1", EventKind::PreToolUse, 2));
        assert!(session(&store, "s1").is_some());
    }

    #[test]
    fn concurrent_producers_do_not_lose_updates() {
        let store = Arc::new(SessionStore::default());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for index in 0..50 {
                        let agent_id = format!("agent-{}-{}", worker, index);
                        store.apply(&agent_event("shared", EventKind::SubagentStart, &agent_id, index));
                        store.apply(&event(&format!("own-{}", worker), EventKind::PreToolUse, index));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker");
        }

        let view = session(&store, "shared").expect("shared");
        assert_eq!(view.agents.len(), 400);
        assert_eq!(store.len(), 9);
    }
}
