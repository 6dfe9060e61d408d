//! SQLite event log for agent-monitor-daemon.
//!
//! Accepted events are appended here so a restarted daemon can rebuild its
//! in-memory view. The log is trimmed as sessions end or are removed, and
//! sessions that have been quiet for longer than the retention window are
//! pruned as a whole, at startup and periodically after that.

use agent_monitor_protocol::EventRecord;
use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OpenFlags};
use std::path::PathBuf;

pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    /// Appends one event. Re-delivered events (same `event_id`) are ignored.
    pub fn insert_event(&self, event: &EventRecord) -> Result<(), String> {
        self.with_connection(|conn| {
            let payload = serde_json::to_string(event)
                .map_err(|err| format!("Failed to serialize event payload: {}", err))?;

            conn.execute(
                "INSERT INTO events (event_id, recorded_at, event_kind, session_id, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(event_id) DO NOTHING",
                params![
                    event.event_id,
                    Utc::now().to_rfc3339(),
                    event.event_kind.as_str(),
                    event.session_id,
                    payload
                ],
            )
            .map_err(|err| format!("Failed to insert event: {}", err))?;

            Ok(())
        })
    }

    /// Every logged event in arrival order. Rows that no longer decode are
    /// skipped with a warning rather than failing the whole replay.
    pub fn list_events(&self) -> Result<Vec<EventRecord>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, payload FROM events ORDER BY id ASC")
                .map_err(|err| format!("Failed to prepare events query: {}", err))?;

            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
                .map_err(|err| format!("Failed to read event rows: {}", err))?;

            let mut events = Vec::new();
            for row in rows {
                let (id, payload) =
                    row.map_err(|err| format!("Failed to decode event row: {}", err))?;
                match serde_json::from_str::<EventRecord>(&payload) {
                    Ok(event) => events.push(event),
                    Err(err) => {
                        tracing::warn!(row_id = id, error = %err, "Skipping undecodable event row");
                    }
                }
            }

            Ok(events)
        })
    }

    pub fn count_events(&self) -> Result<u64, String> {
        self.with_connection(|conn| {
            conn.query_row("SELECT COUNT(*) FROM events", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|count| count as u64)
            .map_err(|err| format!("Failed to count events: {}", err))
        })
    }

    pub fn delete_session_events(&self, session_id: &str) -> Result<u64, String> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM events WHERE session_id = ?1",
                params![session_id],
            )
            .map(|count| count as u64)
            .map_err(|err| format!("Failed to delete session events: {}", err))
        })
    }

    pub fn clear_events(&self) -> Result<u64, String> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM events", [])
                .map(|count| count as u64)
                .map_err(|err| format!("Failed to clear events: {}", err))
        })
    }

    /// Drops every row of each session whose newest row is older than
    /// `max_age_hours`. A session is never pruned partially: replaying a
    /// tail without its first events would change sticky fields and
    /// `created_at`.
    pub fn prune_older_than(&self, max_age_hours: i64) -> Result<u64, String> {
        let cutoff = (Utc::now() - Duration::hours(max_age_hours)).to_rfc3339();
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM events WHERE session_id IN ( \
                    SELECT session_id FROM events \
                    GROUP BY session_id \
                    HAVING MAX(recorded_at) < ?1)",
                params![cutoff],
            )
            .map(|count| count as u64)
            .map_err(|err| format!("Failed to prune events: {}", err))
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_id TEXT UNIQUE,
                    recorded_at TEXT NOT NULL,
                    event_kind TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    payload TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS events_session_id ON events (session_id);
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}
