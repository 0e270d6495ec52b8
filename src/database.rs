use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use log::info;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Single SQLite database behind all durable state. Writers share the
/// connection through a mutex; transactional isolation comes from SQLite.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create directory {parent:?}"))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {path:?}"))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Self::migrate(&conn)?;
        info!("Database opened: path={}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS device_info (
                id INTEGER PRIMARY KEY,
                device_id TEXT UNIQUE NOT NULL,
                device_name TEXT,
                device_token TEXT,
                registered_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                last_sync_at TIMESTAMP,
                token_expires_at TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS pending_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_data TEXT NOT NULL,
                device_id TEXT NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                retry_count INTEGER DEFAULT 0,
                last_attempt TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_pending_events_device ON pending_events(device_id);
            CREATE INDEX IF NOT EXISTS idx_pending_events_created ON pending_events(created_at);",
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations (version) VALUES (1)",
            [],
        )?;
        Ok(())
    }

    /// Upsert this device's registration record.
    pub fn record_device(
        &self,
        device_id: &str,
        device_name: &str,
        device_token: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        conn.execute(
            "INSERT INTO device_info (device_id, device_name, device_token, last_sync_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(device_id) DO UPDATE SET
                 device_name = excluded.device_name,
                 device_token = excluded.device_token,
                 last_sync_at = excluded.last_sync_at",
            params![device_id, device_name, device_token, now_text()],
        )?;
        Ok(())
    }

    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }
}

/// Timestamp text with fixed precision so lexicographic ordering matches
/// chronological ordering.
pub(crate) fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
