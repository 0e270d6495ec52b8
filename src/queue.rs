use crate::database::{now_text, Database};
use crate::events::TrackingEvent;
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use log::{debug, error, info};
use rusqlite::{params, params_from_iter, Connection};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Durable fallback queue for undelivered events. One row per event;
/// dequeue order follows creation time, so batches drain oldest-first.
#[derive(Clone)]
pub struct EventQueue {
    conn: Arc<Mutex<Connection>>,
}

impl EventQueue {
    pub fn new(database: &Database) -> Self {
        Self {
            conn: database.connection(),
        }
    }

    /// Insert every event of a failed batch in one transaction. An event that
    /// cannot be serialised is logged and skipped without aborting the rest.
    pub fn enqueue(&self, device_id: &str, events: &[TrackingEvent]) -> Result<()> {
        let mut conn = self.conn.lock().expect("queue lock poisoned");
        let tx = conn.transaction().context("failed to begin transaction")?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO pending_events (event_data, device_id, created_at, retry_count)
                     VALUES (?1, ?2, ?3, 0)",
                )
                .context("failed to prepare insert")?;
            for event in events {
                let event_data = match serde_json::to_string(event) {
                    Ok(data) => data,
                    Err(e) => {
                        error!("Failed to serialise event, skipping: {e}");
                        continue;
                    }
                };
                if let Err(e) = stmt.execute(params![event_data, device_id, now_text()]) {
                    error!("Failed to enqueue event: {e}");
                }
            }
        }
        tx.commit().context("failed to commit transaction")?;

        debug!("Events enqueued: count={} device_id={device_id}", events.len());
        Ok(())
    }

    /// Oldest-first batch of pending events with their row ids. A row whose
    /// payload no longer deserialises is deleted and skipped.
    pub fn dequeue(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<(Vec<TrackingEvent>, Vec<i64>)> {
        let conn = self.conn.lock().expect("queue lock poisoned");

        let mut stmt = conn
            .prepare(
                "SELECT id, event_data FROM pending_events
                 WHERE device_id = ?1
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?2",
            )
            .context("failed to prepare select")?;
        let rows = stmt
            .query_map(params![device_id, limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .context("failed to query pending events")?;

        let mut events = Vec::new();
        let mut ids = Vec::new();
        let mut corrupted = Vec::new();
        for row in rows {
            let (id, event_data) = row.context("failed to read pending event row")?;
            match serde_json::from_str::<TrackingEvent>(&event_data) {
                Ok(event) => {
                    events.push(event);
                    ids.push(id);
                }
                Err(e) => {
                    error!("Failed to deserialise queued event id={id}, removing: {e}");
                    corrupted.push(id);
                }
            }
        }
        drop(stmt);

        for id in corrupted {
            let _ = conn.execute("DELETE FROM pending_events WHERE id = ?1", params![id]);
        }

        Ok((events, ids))
    }

    pub fn remove(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().expect("queue lock poisoned");
        let placeholders = placeholders(ids.len());
        let removed = conn
            .execute(
                &format!("DELETE FROM pending_events WHERE id IN ({placeholders})"),
                params_from_iter(ids.iter()),
            )
            .context("failed to remove events")?;
        debug!("Events removed from queue: count={removed}");
        Ok(())
    }

    pub fn increment_retry(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().expect("queue lock poisoned");
        let placeholders = placeholders(ids.len());
        let sql = format!(
            "UPDATE pending_events
             SET retry_count = retry_count + 1, last_attempt = ?1
             WHERE id IN ({placeholders})"
        );
        let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(ids.len() + 1);
        values.push(rusqlite::types::Value::Text(now_text()));
        values.extend(ids.iter().map(|id| rusqlite::types::Value::Integer(*id)));
        conn.execute(&sql, params_from_iter(values))
            .context("failed to increment retry")?;
        Ok(())
    }

    pub fn pending_count(&self, device_id: &str) -> Result<i64> {
        let conn = self.conn.lock().expect("queue lock poisoned");
        conn.query_row(
            "SELECT COUNT(*) FROM pending_events WHERE device_id = ?1",
            params![device_id],
            |row| row.get(0),
        )
        .context("failed to get pending count")
    }

    /// Drop poison rows: older than `older_than` AND retried more than ten
    /// times. The only path that discards events without delivery.
    pub fn cleanup(&self, older_than: Duration) -> Result<usize> {
        let cutoff = (Utc::now()
            - ChronoDuration::from_std(older_than).context("invalid cleanup window")?)
        .to_rfc3339_opts(SecondsFormat::Micros, true);

        let conn = self.conn.lock().expect("queue lock poisoned");
        let removed = conn
            .execute(
                "DELETE FROM pending_events WHERE created_at < ?1 AND retry_count > 10",
                params![cutoff],
            )
            .context("failed to cleanup old events")?;
        if removed > 0 {
            info!("Cleaned up old events: count={removed}");
        }
        Ok(removed)
    }
}

fn placeholders(count: usize) -> String {
    let mut out = String::with_capacity(count * 2);
    for i in 0..count {
        if i > 0 {
            out.push(',');
        }
        out.push('?');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::ActivityState;
    use tempfile::tempdir;

    fn event(n: i64) -> TrackingEvent {
        TrackingEvent {
            device_id: "dev-1".into(),
            timestamp: n,
            status: ActivityState::Active,
            application: Some("chrome".into()),
            title: None,
            url: None,
            duration: None,
            project_id: None,
        }
    }

    fn queue() -> (tempfile::TempDir, EventQueue) {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("agent.db")).expect("open");
        (dir, EventQueue::new(&db))
    }

    #[test]
    fn increment_retry_placeholders_are_comma_separated() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?,?,?");
    }

    #[test]
    fn enqueue_dequeue_preserves_order_and_content() {
        let (_dir, queue) = queue();
        queue
            .enqueue("dev-1", &[event(1), event(2), event(3)])
            .expect("enqueue");

        let (events, ids) = queue.dequeue("dev-1", 10).expect("dequeue");
        assert_eq!(events.len(), 3);
        assert_eq!(ids.len(), 3);
        assert_eq!(
            events.iter().map(|e| e.timestamp).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn dequeue_respects_limit_and_device() {
        let (_dir, queue) = queue();
        queue.enqueue("dev-1", &[event(1), event(2)]).expect("enqueue");
        queue.enqueue("dev-2", &[event(9)]).expect("enqueue");

        let (events, _) = queue.dequeue("dev-1", 1).expect("dequeue");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, 1);
        assert_eq!(queue.pending_count("dev-2").expect("count"), 1);
    }

    #[test]
    fn remove_leaves_the_rest() {
        let (_dir, queue) = queue();
        queue
            .enqueue("dev-1", &[event(1), event(2), event(3)])
            .expect("enqueue");
        let (_, ids) = queue.dequeue("dev-1", 2).expect("dequeue");
        queue.remove(&ids).expect("remove");
        assert_eq!(queue.pending_count("dev-1").expect("count"), 1);

        queue.remove(&[]).expect("empty remove is a no-op");
    }

    #[test]
    fn corrupted_rows_are_deleted_on_dequeue() {
        let (_dir, queue) = queue();
        queue.enqueue("dev-1", &[event(1)]).expect("enqueue");
        {
            let conn = queue.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO pending_events (event_data, device_id, created_at, retry_count)
                 VALUES ('not json', 'dev-1', ?1, 0)",
                params![now_text()],
            )
            .expect("insert corrupt row");
        }

        let (events, ids) = queue.dequeue("dev-1", 10).expect("dequeue");
        assert_eq!(events.len(), 1);
        assert_eq!(ids.len(), 1);
        assert_eq!(queue.pending_count("dev-1").expect("count"), 1);
    }

    #[test]
    fn increment_retry_bumps_count_and_sets_last_attempt() {
        let (_dir, queue) = queue();
        queue.enqueue("dev-1", &[event(1)]).expect("enqueue");
        let (_, ids) = queue.dequeue("dev-1", 10).expect("dequeue");
        queue.increment_retry(&ids).expect("retry");
        queue.increment_retry(&ids).expect("retry");

        let conn = queue.conn.lock().unwrap();
        let (retry_count, last_attempt): (i64, Option<String>) = conn
            .query_row(
                "SELECT retry_count, last_attempt FROM pending_events WHERE id = ?1",
                params![ids[0]],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("row");
        assert_eq!(retry_count, 2);
        assert!(last_attempt.is_some());
    }

    #[test]
    fn cleanup_only_drops_old_and_exhausted_rows() {
        let (_dir, queue) = queue();
        queue.enqueue("dev-1", &[event(1), event(2)]).expect("enqueue");

        let old = (Utc::now() - ChronoDuration::days(10))
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        {
            let conn = queue.conn.lock().unwrap();
            // One old row past the retry budget, one old row still in budget.
            conn.execute(
                "INSERT INTO pending_events (event_data, device_id, created_at, retry_count)
                 VALUES (?1, 'dev-1', ?2, 11)",
                params![serde_json::to_string(&event(97)).unwrap(), old],
            )
            .expect("insert");
            conn.execute(
                "INSERT INTO pending_events (event_data, device_id, created_at, retry_count)
                 VALUES (?1, 'dev-1', ?2, 10)",
                params![serde_json::to_string(&event(98)).unwrap(), old],
            )
            .expect("insert");
        }

        let removed = queue
            .cleanup(Duration::from_secs(7 * 24 * 3600))
            .expect("cleanup");
        assert_eq!(removed, 1);
        assert_eq!(queue.pending_count("dev-1").expect("count"), 3);
    }
}
