// Status file + compaction marker watcher: these two on-disk formats are
// plain data contracts, so this watcher is intentionally lighter than the
// Transcript Watcher — a poll loop over each known session's `<cwd>/.claude`
// directory at the same cadence as the Transcript Watcher's own fallback
// poll, rather than a second notify-based recursive watch.

use crate::db::{terminal_link, Db};
use crate::formats::{compaction_marker, status_file};
use crate::store::{SessionStore, StoreEvent};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub fn spawn(store: Arc<SessionStore>, db: Arc<Db>) {
    let (tx, rx) = mpsc::unbounded_channel::<StoreEvent>();
    store.subscribe(Box::new(move |event: &StoreEvent| {
        let _ = tx.send(event.clone());
    }));
    tokio::spawn(run(store, db, rx));
}

async fn run(store: Arc<SessionStore>, db: Arc<Db>, mut rx: mpsc::UnboundedReceiver<StoreEvent>) {
    let mut cwds: HashMap<String, String> = HashMap::new();
    let mut marker_last_seen: HashMap<PathBuf, DateTime<Utc>> = HashMap::new();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(StoreEvent::Discovered(session)) => {
                        if let Some(cwd) = session.cwd {
                            cwds.insert(session.session_id, cwd);
                        }
                    }
                    Some(StoreEvent::Removed { session_id }) => {
                        cwds.remove(&session_id);
                    }
                    Some(_) => {}
                    None => return,
                }
            }
            _ = ticker.tick() => {
                let snapshot: Vec<(String, String)> = cwds.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                for (session_id, cwd) in snapshot {
                    poll_status_file(&store, &session_id, &cwd).await;
                    poll_compaction_markers(&db, &cwd, &mut marker_last_seen).await;
                }
            }
        }
    }
}

async fn poll_status_file(store: &Arc<SessionStore>, session_id: &str, cwd: &str) {
    let path = PathBuf::from(cwd).join(".claude").join("status.md");
    let Ok(raw) = tokio::fs::read_to_string(&path).await else {
        return;
    };
    let Some(frontmatter) = status_file::parse(&raw) else {
        return;
    };
    if !status_file::is_fresh(&frontmatter, Utc::now()) {
        return;
    }
    store.update_file_status(session_id, frontmatter.status.to_store_status()).await;
}

/// Finds and deletes any compaction markers in `<cwd>/.claude`, resolving
/// the compaction predecessor by matching terminal link / repo path.
/// Logged rather than dispatched over the wire: there is no compaction
/// outbound message type, only the detection-and-delete behavior.
async fn poll_compaction_markers(db: &Arc<Db>, cwd: &str, last_seen: &mut HashMap<PathBuf, DateTime<Utc>>) {
    let dir = PathBuf::from(cwd).join(".claude");
    let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
        return;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if compaction_marker::parse_filename(&path).is_none() {
            continue;
        }
        let Ok(raw) = tokio::fs::read_to_string(&path).await else {
            continue;
        };
        let Some(marker) = compaction_marker::parse_body(&raw) else {
            let _ = tokio::fs::remove_file(&path).await;
            continue;
        };

        let now = Utc::now();
        if compaction_marker::is_duplicate(last_seen.get(&path).copied(), now) {
            let _ = tokio::fs::remove_file(&path).await;
            continue;
        }
        last_seen.insert(path.clone(), now);

        let repo = marker.cwd.clone();
        let predecessor = db
            .interact(move |conn| terminal_link::most_recent_for_repo(conn, &repo))
            .await
            .ok()
            .flatten();

        tracing::info!(
            new_session_id = %marker.new_session_id,
            predecessor = ?predecessor.map(|p| p.session_id),
            "compaction marker observed"
        );
        let _ = tokio::fs::remove_file(&path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStatus;
    use crate::transcript::status::UiStatus;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fresh_status_file_updates_store_file_status() {
        let tmp = tempdir().unwrap();
        let claude_dir = tmp.path().join(".claude");
        tokio::fs::create_dir_all(&claude_dir).await.unwrap();
        tokio::fs::write(
            claude_dir.join("status.md"),
            format!("---\nstatus: waiting_for_approval\nupdated: {}\n---\nbody\n", Utc::now().to_rfc3339()),
        )
        .await
        .unwrap();

        let store = SessionStore::new();
        store
            .add_from_watcher(&crate::transcript::watcher::SessionState {
                session_id: "s1".to_string(),
                filepath: PathBuf::from("/tmp/s1.jsonl"),
                byte_position: 0,
                cwd: Some(tmp.path().to_string_lossy().to_string()),
                git_branch: None,
                original_prompt: None,
                started_at: Some(Utc::now()),
                entries: vec![],
                status: crate::transcript::status::derive_status(&[], Utc::now()),
            })
            .await;

        poll_status_file(&store, "s1", &tmp.path().to_string_lossy()).await;

        let session = store.get("s1").await.unwrap();
        assert_eq!(session.file_status, Some(FileStatus::WaitingForApproval));
        assert_eq!(session.status, UiStatus::Waiting);
    }

    #[tokio::test]
    async fn compaction_marker_is_deleted_after_processing() {
        let tmp = tempdir().unwrap();
        let claude_dir = tmp.path().join(".claude");
        tokio::fs::create_dir_all(&claude_dir).await.unwrap();
        let marker_path = claude_dir.join("compacted.sess-new.marker");
        tokio::fs::write(
            &marker_path,
            format!(
                r#"{{"newSessionId":"sess-new","cwd":"{}","compactedAt":"{}"}}"#,
                tmp.path().to_string_lossy(),
                Utc::now().to_rfc3339()
            ),
        )
        .await
        .unwrap();

        let db = Arc::new(Db::open_in_memory().unwrap());
        let mut last_seen = HashMap::new();
        poll_compaction_markers(&db, &tmp.path().to_string_lossy(), &mut last_seen).await;

        assert!(!marker_path.exists());
    }
}
