// Outbox: a monotonically-keyed append-only table, the authoritative cursor
// the Commander uses to build its fleet prelude.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct OutboxEvent {
    pub event_id: i64,
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub payload_json: String,
    pub delivered: bool,
    pub project_id: Option<String>,
    pub briefing_id: Option<i64>,
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<OutboxEvent> {
    let ts: String = row.get(1)?;
    Ok(OutboxEvent {
        event_id: row.get(0)?,
        ts: DateTime::parse_from_rfc3339(&ts)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        event_type: row.get(2)?,
        payload_json: row.get(3)?,
        delivered: row.get::<_, i64>(4)? != 0,
        project_id: row.get(5)?,
        briefing_id: row.get(6)?,
    })
}

/// Fetch events strictly after `after_event_id`, oldest first, bounded to
/// `limit` rows — the Commander's fleet prelude caps this at `maxEvents=50`.
pub fn fetch_since(conn: &Connection, after_event_id: i64, limit: u32) -> Result<Vec<OutboxEvent>> {
    let mut stmt = conn
        .prepare(
            "SELECT event_id, ts, type, payload_json, delivered, project_id, briefing_id
             FROM outbox_events WHERE event_id > ?1 ORDER BY event_id ASC LIMIT ?2",
        )
        .context("failed to prepare outbox fetch_since")?;
    let rows = stmt
        .query_map(params![after_event_id, limit], row_to_event)
        .context("failed to query outbox events")?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to collect outbox events")
}

pub fn mark_delivered(conn: &Connection, event_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE outbox_events SET delivered = 1 WHERE event_id = ?1",
        params![event_id],
    )
    .context("failed to mark outbox event delivered")?;
    Ok(())
}

/// Prune delivered events older than `before`. Undelivered events are
/// retained indefinitely regardless of age.
pub fn prune_delivered_before(conn: &Connection, before: DateTime<Utc>) -> Result<usize> {
    let n = conn
        .execute(
            "DELETE FROM outbox_events WHERE delivered = 1 AND ts < ?1",
            params![before.to_rfc3339()],
        )
        .context("failed to prune delivered outbox events")?;
    Ok(n)
}

pub fn latest_event_id(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(event_id), 0) FROM outbox_events", [], |r| r.get(0))
        .context("failed to query latest outbox event id")
}
