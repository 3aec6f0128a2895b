// TerminalLink: `{sessionId PK, externalWindowId, linkedAt, stale, repoPath,
// createdVia}` — persisted association between a session and an
// embedded-terminal window, used for compaction-predecessor matching.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct TerminalLink {
    pub session_id: String,
    pub external_window_id: String,
    pub linked_at: DateTime<Utc>,
    pub stale: bool,
    pub repo_path: Option<String>,
    pub created_via: String,
}

fn row_to_link(row: &rusqlite::Row) -> rusqlite::Result<TerminalLink> {
    let linked_at: String = row.get(2)?;
    Ok(TerminalLink {
        session_id: row.get(0)?,
        external_window_id: row.get(1)?,
        linked_at: DateTime::parse_from_rfc3339(&linked_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        stale: row.get::<_, i64>(3)? != 0,
        repo_path: row.get(4)?,
        created_via: row.get(5)?,
    })
}

pub fn upsert(conn: &Connection, link: &TerminalLink) -> Result<()> {
    conn.execute(
        "INSERT INTO terminal_links (session_id, external_window_id, linked_at, stale, repo_path, created_via)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(session_id) DO UPDATE SET
            external_window_id = excluded.external_window_id,
            linked_at = excluded.linked_at,
            stale = excluded.stale,
            repo_path = excluded.repo_path,
            created_via = excluded.created_via",
        params![
            link.session_id,
            link.external_window_id,
            link.linked_at.to_rfc3339(),
            link.stale as i64,
            link.repo_path,
            link.created_via,
        ],
    )
    .context("failed to upsert terminal link")?;
    Ok(())
}

pub fn get(conn: &Connection, session_id: &str) -> Result<Option<TerminalLink>> {
    conn.query_row(
        "SELECT session_id, external_window_id, linked_at, stale, repo_path, created_via
         FROM terminal_links WHERE session_id = ?1",
        params![session_id],
        row_to_link,
    )
    .optional()
    .context("failed to query terminal link")
}

pub fn mark_stale(conn: &Connection, session_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE terminal_links SET stale = 1 WHERE session_id = ?1",
        params![session_id],
    )
    .context("failed to mark terminal link stale")?;
    Ok(())
}

/// Find the most recently linked, non-stale session for a given `cwd`
/// (joined against the repo path), used to pick a compaction predecessor
/// when multiple candidates share a working directory.
pub fn most_recent_for_repo(conn: &Connection, repo_path: &str) -> Result<Option<TerminalLink>> {
    conn.query_row(
        "SELECT session_id, external_window_id, linked_at, stale, repo_path, created_via
         FROM terminal_links WHERE repo_path = ?1 AND stale = 0
         ORDER BY linked_at DESC LIMIT 1",
        params![repo_path],
        row_to_link,
    )
    .optional()
    .context("failed to query most recent terminal link")
}
