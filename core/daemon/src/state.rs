//! Shared daemon state: the in-memory store plus its event log.
//!
//! The store is authoritative for reads. The log exists only so a restart
//! can rebuild the store, so log failures are logged and otherwise ignored.

use agent_monitor_protocol::{EventKind, EventRecord, SessionView};
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex, PoisonError};

use crate::db::Db;
use crate::notifier::Subscription;
use crate::replay::replay_into;
use crate::store::{ApplyOutcome, SessionStore};

const LOG_PRUNE_INTERVAL_MINS: i64 = 10;

pub struct SharedState {
    db: Db,
    store: Arc<SessionStore>,
    retention_hours: i64,
    // Log append and store apply happen under one lock so replay order
    // matches live order.
    ingest: Mutex<()>,
    last_log_prune: Mutex<DateTime<Utc>>,
}

impl SharedState {
    pub fn new(db: Db, store: Arc<SessionStore>, retention_hours: i64) -> Self {
        match replay_into(&db, &store, retention_hours) {
            Ok(0) => {}
            Ok(replayed) => {
                tracing::info!(
                    replayed,
                    sessions = store.len(),
                    "Rebuilt session state from event log"
                );
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to replay event log");
            }
        }

        Self {
            db,
            store,
            retention_hours,
            ingest: Mutex::new(()),
            last_log_prune: Mutex::new(Utc::now()),
        }
    }

    /// Applies and logs one event. Returns false if the record was dropped,
    /// either as invalid or as a straggler for an ended session; dropped
    /// records are not logged.
    pub fn update_from_event(&self, event: &EventRecord) -> bool {
        if let Err(err) = event.validate() {
            tracing::debug!(
                code = %err.code,
                event_kind = event.event_kind.as_str(),
                "Event rejected"
            );
            return false;
        }

        tracing::info!(
            session_id = %event.session_id,
            event_kind = event.event_kind.as_str(),
            agent_id = event.agent_key().unwrap_or(""),
            tool_name = event.tool_name.as_deref().unwrap_or(""),
            "Event received"
        );

        let _guard = self.ingest.lock().unwrap_or_else(PoisonError::into_inner);

        if self.store.apply(event) == ApplyOutcome::Rejected {
            tracing::debug!(
                session_id = %event.session_id,
                event_kind = event.event_kind.as_str(),
                "Event dropped by store"
            );
            return false;
        }

        // An ended session only needs its SessionEnd kept, which is what
        // blocks stragglers after a restart.
        if event.event_kind == EventKind::SessionEnd {
            if let Err(err) = self.db.delete_session_events(&event.session_id) {
                tracing::warn!(error = %err, "Failed to trim ended session from event log");
            }
        }
        if let Err(err) = self.db.insert_event(event) {
            tracing::warn!(error = %err, "Failed to persist daemon event");
        }
        true
    }

    /// One sweeper tick: demotes stale state and, every few minutes, drops
    /// sessions that fell out of the retention window from the event log.
    pub fn maintain(&self, now: DateTime<Utc>) -> bool {
        let changed = self.store.sweep(now);

        let prune_due = {
            let mut last = self
                .last_log_prune
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if now.signed_duration_since(*last) >= Duration::minutes(LOG_PRUNE_INTERVAL_MINS) {
                *last = now;
                true
            } else {
                false
            }
        };
        if prune_due {
            self.prune_event_log();
        }

        changed
    }

    fn prune_event_log(&self) {
        let _guard = self.ingest.lock().unwrap_or_else(PoisonError::into_inner);
        match self.db.prune_older_than(self.retention_hours) {
            Ok(0) => {}
            Ok(pruned) => tracing::info!(pruned, "Pruned expired sessions from event log"),
            Err(err) => tracing::warn!(error = %err, "Failed to prune event log"),
        }
    }

    pub fn sessions_snapshot(&self) -> Vec<SessionView> {
        self.store.snapshot()
    }

    pub fn dismiss_session(&self, session_id: &str) -> bool {
        let _guard = self.ingest.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = self.db.delete_session_events(session_id) {
            tracing::warn!(error = %err, "Failed to delete dismissed session from event log");
        }
        self.store.dismiss(session_id)
    }

    pub fn clear_sessions(&self) -> usize {
        let _guard = self.ingest.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = self.db.clear_events() {
            tracing::warn!(error = %err, "Failed to clear event log");
        }
        self.store.clear_all()
    }

    pub fn subscribe(&self) -> Subscription {
        self.store.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.store.len()
    }

    pub fn generation(&self) -> u64 {
        self.store.generation()
    }

    pub fn logged_event_count(&self) -> Option<u64> {
        match self.db.count_events() {
            Ok(count) => Some(count),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to count logged events");
                None
            }
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.store.subscriber_count()
    }
}
