// Briefing table + idempotent ingestion: upsert briefing + insert outbox
// event inside one transaction, with `ON CONFLICT DO NOTHING` on the
// `(project_id, session_id, task_id, ended_at)` unique key so re-ingesting
// the same status document bytes twice produces exactly one row and at
// most one outbox event.

use crate::formats::status_v5::StatusV5Document;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Briefing {
    pub briefing_id: i64,
    pub project_id: String,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub impact_level: String,
    pub doc_drift_risk: String,
    pub base_commit: Option<String>,
    pub head_commit: Option<String>,
    pub branch: Option<String>,
    pub blockers: Vec<String>,
    pub next_steps: Vec<String>,
    pub docs_touched: Vec<String>,
    pub files_touched: Vec<String>,
    pub raw_markdown: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub success: bool,
    pub is_duplicate: bool,
    pub briefing_id: Option<i64>,
}

/// Parse `raw` as a status.v5 document and ingest it. A project id is
/// required by the schema; callers without one (ad hoc briefings) should
/// fall back to a stable placeholder derived from `repo_root`/cwd upstream
/// of this function — this module only persists, it never invents an id.
pub fn ingest(conn: &mut Connection, raw: &str, project_id: &str) -> Result<IngestResult> {
    let doc = match crate::formats::status_v5::parse(raw) {
        Some(doc) => doc,
        None => {
            return Ok(IngestResult {
                success: false,
                is_duplicate: false,
                briefing_id: None,
            })
        }
    };
    ingest_document(conn, &doc, project_id)
}

pub fn ingest_document(
    conn: &mut Connection,
    doc: &StatusV5Document,
    project_id: &str,
) -> Result<IngestResult> {
    let fm = &doc.frontmatter;
    let now = Utc::now();

    let tx = conn.transaction().context("failed to start briefing ingest transaction")?;

    let changed = tx
        .execute(
            "INSERT INTO briefings (
                project_id, session_id, task_id, status, started_at, ended_at,
                impact_level, doc_drift_risk, base_commit, head_commit, branch,
                blockers_json, next_steps_json, docs_touched_json, files_touched_json,
                raw_markdown, created_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)
            ON CONFLICT(project_id, session_id, task_id, ended_at) DO NOTHING",
            params![
                project_id,
                fm.session_id,
                fm.task_id,
                serde_json::to_string(&fm.status)?,
                fm.started_at.map(|t| t.to_rfc3339()),
                fm.ended_at.map(|t| t.to_rfc3339()),
                serde_json::to_string(&fm.impact_level)?,
                serde_json::to_string(&fm.doc_drift_risk)?,
                fm.base_commit,
                fm.head_commit,
                fm.branch,
                serde_json::to_string(&fm.blockers)?,
                serde_json::to_string(&fm.next_steps)?,
                serde_json::to_string(&fm.docs_touched)?,
                serde_json::to_string(&fm.files_touched)?,
                doc.body,
                now.to_rfc3339(),
            ],
        )
        .context("failed to insert briefing")?;

    if changed == 0 {
        tx.commit().context("failed to commit no-op briefing ingest")?;
        return Ok(IngestResult {
            success: true,
            is_duplicate: true,
            briefing_id: None,
        });
    }

    let briefing_id = tx.last_insert_rowid();

    tx.execute(
        "INSERT INTO outbox_events (ts, type, payload_json, delivered, project_id, briefing_id)
         VALUES (?1, 'briefing', ?2, 0, ?3, ?4)",
        params![
            now.to_rfc3339(),
            serde_json::to_string(fm)?,
            project_id,
            briefing_id,
        ],
    )
    .context("failed to insert outbox event for briefing")?;

    tx.commit().context("failed to commit briefing ingest")?;

    Ok(IngestResult {
        success: true,
        is_duplicate: false,
        briefing_id: Some(briefing_id),
    })
}

pub fn get(conn: &Connection, briefing_id: i64) -> Result<Option<Briefing>> {
    conn.query_row(
        "SELECT briefing_id, project_id, session_id, task_id, status, started_at, ended_at,
                impact_level, doc_drift_risk, base_commit, head_commit, branch,
                blockers_json, next_steps_json, docs_touched_json, files_touched_json,
                raw_markdown, created_at
         FROM briefings WHERE briefing_id = ?1",
        params![briefing_id],
        row_to_briefing,
    )
    .optional()
    .context("failed to query briefing")
}

fn row_to_briefing(row: &rusqlite::Row) -> rusqlite::Result<Briefing> {
    let parse_list = |s: String| -> Vec<String> { serde_json::from_str(&s).unwrap_or_default() };
    let parse_dt = |s: Option<String>| -> Option<DateTime<Utc>> {
        s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };
    Ok(Briefing {
        briefing_id: row.get(0)?,
        project_id: row.get(1)?,
        session_id: row.get(2)?,
        task_id: row.get(3)?,
        status: row.get(4)?,
        started_at: parse_dt(row.get(5)?),
        ended_at: parse_dt(row.get(6)?),
        impact_level: row.get(7)?,
        doc_drift_risk: row.get(8)?,
        base_commit: row.get(9)?,
        head_commit: row.get(10)?,
        branch: row.get(11)?,
        blockers: parse_list(row.get(12)?),
        next_steps: parse_list(row.get(13)?),
        docs_touched: parse_list(row.get(14)?),
        files_touched: parse_list(row.get(15)?),
        raw_markdown: row.get(16)?,
        created_at: parse_dt(row.get(17)?).unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::status_v5::{BriefingStatus, BroadcastLevel, DocDriftRisk, ImpactLevel, StatusV5Frontmatter};

    fn sample_doc(ended_at: DateTime<Utc>) -> StatusV5Document {
        StatusV5Document {
            frontmatter: StatusV5Frontmatter {
                schema: "status.v5".to_string(),
                project_id: None,
                repo_name: None,
                repo_root: None,
                git_remote: None,
                branch: Some("main".to_string()),
                session_id: Some("sess-1".to_string()),
                task_id: None,
                status: BriefingStatus::Completed,
                started_at: Some(ended_at),
                ended_at: Some(ended_at),
                impact_level: ImpactLevel::Minor,
                broadcast_level: BroadcastLevel::Mention,
                doc_drift_risk: DocDriftRisk::Low,
                base_commit: None,
                head_commit: None,
                blockers: vec![],
                next_steps: vec![],
                docs_touched: vec![],
                files_touched: vec![],
            },
            body: "done".to_string(),
        }
    }

    #[test]
    fn ingesting_same_tuple_twice_creates_exactly_one_row_and_one_outbox_event() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(super::super::SCHEMA).unwrap();

        let ended_at = Utc::now();
        let doc = sample_doc(ended_at);

        let first = ingest_document(&mut conn, &doc, "proj-1").unwrap();
        assert!(first.success);
        assert!(!first.is_duplicate);

        let second = ingest_document(&mut conn, &doc, "proj-1").unwrap();
        assert!(second.success);
        assert!(second.is_duplicate);

        let briefing_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM briefings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(briefing_count, 1);

        let outbox_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM outbox_events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(outbox_count, 1);
    }

    #[test]
    fn malformed_raw_bytes_do_not_ingest() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(super::super::SCHEMA).unwrap();

        let result = ingest(&mut conn, "not frontmatter", "proj-1").unwrap();
        assert!(!result.success);
        assert!(result.briefing_id.is_none());
    }
}
