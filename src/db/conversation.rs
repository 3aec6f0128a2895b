// Conversation: singleton row per `kind`, used by the Commander to remember
// its captured `claudeSessionId` and outbox cursor across daemon restarts.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Commander,
    WorkerSession,
}

impl ConversationKind {
    fn as_str(self) -> &'static str {
        match self {
            ConversationKind::Commander => "commander",
            ConversationKind::WorkerSession => "worker_session",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub kind: String,
    pub cwd: String,
    pub model: String,
    pub claude_session_id: Option<String>,
    pub last_outbox_event_id_seen: i64,
}

fn row_to_conversation(row: &rusqlite::Row) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        conversation_id: row.get(0)?,
        kind: row.get(1)?,
        cwd: row.get(2)?,
        model: row.get(3)?,
        claude_session_id: row.get(4)?,
        last_outbox_event_id_seen: row.get(5)?,
    })
}

/// Load the singleton row for `kind`, creating it with `cwd`/`model` if
/// absent. Never creates a second row for the same kind — enforced by the
/// `UNIQUE(kind)` constraint.
pub fn get_or_create(conn: &Connection, kind: ConversationKind, cwd: &str, model: &str) -> Result<Conversation> {
    let existing = conn
        .query_row(
            "SELECT conversation_id, kind, cwd, model, claude_session_id, last_outbox_event_id_seen
             FROM conversations WHERE kind = ?1",
            params![kind.as_str()],
            row_to_conversation,
        )
        .optional()
        .context("failed to query conversation")?;

    if let Some(conv) = existing {
        return Ok(conv);
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO conversations (conversation_id, kind, cwd, model, claude_session_id, last_outbox_event_id_seen, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, NULL, 0, ?5, ?5)",
        params![id, kind.as_str(), cwd, model, now],
    )
    .context("failed to insert conversation")?;

    Ok(Conversation {
        conversation_id: id,
        kind: kind.as_str().to_string(),
        cwd: cwd.to_string(),
        model: model.to_string(),
        claude_session_id: None,
        last_outbox_event_id_seen: 0,
    })
}

pub fn set_claude_session_id(conn: &Connection, conversation_id: &str, claude_session_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET claude_session_id = ?1, updated_at = ?2 WHERE conversation_id = ?3",
        params![claude_session_id, Utc::now().to_rfc3339(), conversation_id],
    )
    .context("failed to set claude_session_id")?;
    Ok(())
}

pub fn set_cursor(conn: &Connection, conversation_id: &str, last_outbox_event_id_seen: i64) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET last_outbox_event_id_seen = ?1, updated_at = ?2 WHERE conversation_id = ?3",
        params![last_outbox_event_id_seen, Utc::now().to_rfc3339(), conversation_id],
    )
    .context("failed to set outbox cursor")?;
    Ok(())
}

/// Reset clears the captured session id only; the cursor is intentionally
/// left alone so a reset conversation doesn't re-replay old fleet activity.
pub fn clear_claude_session_id(conn: &Connection, conversation_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET claude_session_id = NULL, updated_at = ?1 WHERE conversation_id = ?2",
        params![Utc::now().to_rfc3339(), conversation_id],
    )
    .context("failed to clear claude_session_id")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(super::super::SCHEMA).unwrap();
        conn
    }

    #[test]
    fn get_or_create_is_idempotent_per_kind() {
        let conn = test_conn();
        let first = get_or_create(&conn, ConversationKind::Commander, "/repo", "claude").unwrap();
        let second = get_or_create(&conn, ConversationKind::Commander, "/other", "claude").unwrap();
        assert_eq!(first.conversation_id, second.conversation_id);
        assert_eq!(second.cwd, "/repo", "existing row is not overwritten by a later create call");
    }

    #[test]
    fn session_id_capture_persists_across_reload() {
        let conn = test_conn();
        let conv = get_or_create(&conn, ConversationKind::Commander, "/repo", "claude").unwrap();
        set_claude_session_id(&conn, &conv.conversation_id, "sess-abc").unwrap();

        let reloaded = get_or_create(&conn, ConversationKind::Commander, "/repo", "claude").unwrap();
        assert_eq!(reloaded.claude_session_id.as_deref(), Some("sess-abc"));
    }

    #[test]
    fn cursor_commits_even_though_separate_from_session_id() {
        let conn = test_conn();
        let conv = get_or_create(&conn, ConversationKind::Commander, "/repo", "claude").unwrap();
        set_cursor(&conn, &conv.conversation_id, 42).unwrap();
        let reloaded = get_or_create(&conn, ConversationKind::Commander, "/repo", "claude").unwrap();
        assert_eq!(reloaded.last_outbox_event_id_seen, 42);
    }

    #[test]
    fn reset_clears_session_id_but_preserves_cursor() {
        let conn = test_conn();
        let conv = get_or_create(&conn, ConversationKind::Commander, "/repo", "claude").unwrap();
        set_claude_session_id(&conn, &conv.conversation_id, "sess-abc").unwrap();
        set_cursor(&conn, &conv.conversation_id, 7).unwrap();

        clear_claude_session_id(&conn, &conv.conversation_id).unwrap();

        let reloaded = get_or_create(&conn, ConversationKind::Commander, "/repo", "claude").unwrap();
        assert!(reloaded.claude_session_id.is_none());
        assert_eq!(reloaded.last_outbox_event_id_seen, 7);
    }
}
