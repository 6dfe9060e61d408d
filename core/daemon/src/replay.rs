use crate::db::Db;
use crate::store::SessionStore;

/// Prunes the log to the retention window and re-applies what is left.
/// Returns the number of events replayed.
pub fn replay_into(db: &Db, store: &SessionStore, retention_hours: i64) -> Result<usize, String> {
    let pruned = db.prune_older_than(retention_hours)?;
    if pruned > 0 {
        tracing::info!(pruned, "Pruned expired events from log");
    }

    let events = db.list_events()?;
    for event in &events {
        store.apply(event);
    }
    Ok(events.len())
}
