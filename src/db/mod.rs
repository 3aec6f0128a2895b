// Persistence: one `rusqlite::Connection` behind a `Mutex`, backed by SQLite
// rather than a single JSON file.
//
// No reader/writer lock is exposed to callers: every public method takes
// `&self` and does its own locking + `spawn_blocking` hop, so nothing
// outside this module ever sees the `Connection` directly.

pub mod briefing;
pub mod conversation;
pub mod outbox;
pub mod terminal_link;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS briefings (
    briefing_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id    TEXT NOT NULL,
    session_id    TEXT,
    task_id       TEXT,
    status        TEXT NOT NULL,
    started_at    TEXT,
    ended_at      TEXT,
    impact_level  TEXT NOT NULL,
    doc_drift_risk TEXT NOT NULL,
    base_commit   TEXT,
    head_commit   TEXT,
    branch        TEXT,
    blockers_json TEXT NOT NULL DEFAULT '[]',
    next_steps_json TEXT NOT NULL DEFAULT '[]',
    docs_touched_json TEXT NOT NULL DEFAULT '[]',
    files_touched_json TEXT NOT NULL DEFAULT '[]',
    raw_markdown  TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    UNIQUE(project_id, session_id, task_id, ended_at)
);

CREATE TABLE IF NOT EXISTS outbox_events (
    event_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    ts          TEXT NOT NULL,
    type        TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    delivered   INTEGER NOT NULL DEFAULT 0,
    project_id  TEXT,
    briefing_id INTEGER
);

CREATE TABLE IF NOT EXISTS conversations (
    conversation_id TEXT PRIMARY KEY,
    kind            TEXT NOT NULL UNIQUE,
    cwd             TEXT NOT NULL,
    model           TEXT NOT NULL,
    claude_session_id TEXT,
    last_outbox_event_id_seen INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS terminal_links (
    session_id        TEXT PRIMARY KEY,
    external_window_id TEXT NOT NULL,
    linked_at         TEXT NOT NULL,
    stale             INTEGER NOT NULL DEFAULT 0,
    repo_path         TEXT,
    created_via       TEXT NOT NULL
);
";

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create db directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite db at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to set WAL mode")?;
        conn.execute_batch(SCHEMA).context("failed to apply schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite db")?;
        conn.execute_batch(SCHEMA).context("failed to apply schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on a blocking thread, matching the
    /// `pool.interact` technique the Mira example uses to keep synchronous
    /// rusqlite calls off the async executor.
    pub async fn interact<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap();
            f(&mut guard)
        })
        .await
        .context("db task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_applies_schema_idempotently() {
        let db = Db::open_in_memory().unwrap();
        db.interact(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .unwrap();
    }
}
