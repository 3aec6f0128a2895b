// Transcript Watcher (component C): directory watch + debounce, owning
// per-session (filepath, bytePosition, entries, status). Generalizes the
// single-`WatchedFile` Claude Code JSONL tailer to a `HashMap<PathBuf, _>`
// keyed by session path, using the same notify + debounce + fallback-poll
// technique.

use crate::transcript::entry::LogEntry;
use crate::transcript::parser::{self, ExtractedMetadata};
use crate::transcript::status::{self, StatusResult};
use chrono::Utc;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Duration;

const DEBOUNCE_MS: u64 = 200;
const FALLBACK_POLL_MS: u64 = 2000;
const MAX_ENTRIES_PER_SESSION: usize = 500;

/// A watcher-owned session snapshot. Consumers MUST treat this as immutable
/// — it is handed out by value specifically so nothing downstream can
/// mutate the watcher's own bookkeeping.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub filepath: PathBuf,
    pub byte_position: u64,
    pub cwd: Option<String>,
    pub git_branch: Option<String>,
    pub original_prompt: Option<String>,
    pub started_at: Option<chrono::DateTime<Utc>>,
    pub entries: Vec<LogEntry>,
    pub status: StatusResult,
}

#[derive(Debug, Clone)]
pub enum WatcherEvent {
    Created(SessionState),
    Updated(SessionState),
    Deleted { session_id: String },
}

struct Tracked {
    state: SessionState,
    last_message_count: u64,
}

/// Sub-session transcripts (spawned agent sub-tasks) use a distinguishing
/// basename suffix and are ignored by the fleet-level watcher.
fn is_sub_session(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.contains(".agent-"))
        .unwrap_or(false)
}

pub struct TranscriptWatcher {
    sessions: Arc<RwLock<HashMap<PathBuf, Tracked>>>,
    events_tx: broadcast::Sender<WatcherEvent>,
}

impl TranscriptWatcher {
    pub fn events(&self) -> broadcast::Receiver<WatcherEvent> {
        self.events_tx.subscribe()
    }

    pub async fn snapshot(&self) -> Vec<SessionState> {
        self.sessions
            .read()
            .await
            .values()
            .map(|t| t.state.clone())
            .collect()
    }

    /// Explicit delete: remove bookkeeping, emit `deleted`, and unlink the
    /// underlying file.
    pub async fn delete_session(&self, session_id: &str) -> std::io::Result<()> {
        let path = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .find(|t| t.state.session_id == session_id)
                .map(|t| t.state.filepath.clone())
        };
        if let Some(path) = path {
            self.sessions.write().await.remove(&path);
            let _ = self.events_tx.send(WatcherEvent::Deleted {
                session_id: session_id.to_string(),
            });
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// Spawn the watcher's dispatch loop over `projects_root`, recursively. Only
/// the spawning task and the dispatch loop it owns ever write the session
/// map, satisfying the "at most one in-flight handler per filepath" and
/// "single dispatch loop" concurrency contract.
pub fn spawn(projects_root: PathBuf) -> Arc<TranscriptWatcher> {
    let sessions = Arc::new(RwLock::new(HashMap::new()));
    let (events_tx, _) = broadcast::channel(1024);
    let watcher = Arc::new(TranscriptWatcher {
        sessions: sessions.clone(),
        events_tx: events_tx.clone(),
    });

    tokio::spawn(run_dispatch_loop(projects_root, sessions, events_tx));
    watcher
}

/// A raw filesystem notification, tagged so the dispatch loop can tell an
/// unlink apart from a write without re-`stat`ing the path itself.
enum FsChange {
    Upsert(PathBuf),
    Remove(PathBuf),
}

async fn run_dispatch_loop(
    projects_root: PathBuf,
    sessions: Arc<RwLock<HashMap<PathBuf, Tracked>>>,
    events_tx: broadcast::Sender<WatcherEvent>,
) {
    let (notify_tx, mut notify_rx) = mpsc::channel::<FsChange>(256);

    let _fs_watcher = match build_fs_watcher(&projects_root, notify_tx) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!("transcript watcher failed to start: {}", e);
            return;
        }
    };

    let mut known_paths: Vec<PathBuf> = Vec::new();

    loop {
        tokio::select! {
            Some(change) = notify_rx.recv() => {
                // Drain any further notifications that arrived while we
                // were busy, so a burst of writes to one file debounces
                // into a single handle_path call. Last event per path wins
                // within the window (a remove following an upsert, or vice
                // versa, is resolved in arrival order).
                let mut pending: HashMap<PathBuf, bool> = HashMap::new();
                record_change(&mut pending, change);
                tokio::time::sleep(Duration::from_millis(DEBOUNCE_MS)).await;
                while let Ok(change) = notify_rx.try_recv() {
                    record_change(&mut pending, change);
                }
                let mut paths: Vec<PathBuf> = pending.keys().cloned().collect();
                paths.sort();
                for path in paths {
                    let is_remove = pending[&path];
                    if is_remove {
                        known_paths.retain(|p| p != &path);
                        handle_removed_path(&path, &sessions, &events_tx).await;
                    } else {
                        if !known_paths.contains(&path) {
                            known_paths.push(path.clone());
                        }
                        handle_path(&path, &sessions, &events_tx).await;
                    }
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(FALLBACK_POLL_MS)) => {
                // inotify/fsevents can miss events; periodically re-check
                // every known file's length against bytePosition, and treat
                // a file that's vanished since the last check as a missed
                // unlink notification.
                for path in known_paths.clone() {
                    match std::fs::metadata(&path) {
                        Ok(meta) => {
                            let needs_read = {
                                let sessions = sessions.read().await;
                                sessions
                                    .get(&path)
                                    .map(|t| meta.len() > t.state.byte_position)
                                    .unwrap_or(false)
                            };
                            if needs_read {
                                handle_path(&path, &sessions, &events_tx).await;
                            }
                        }
                        Err(_) => {
                            known_paths.retain(|p| p != &path);
                            handle_removed_path(&path, &sessions, &events_tx).await;
                        }
                    }
                }
            }
        }
    }
}

fn record_change(pending: &mut HashMap<PathBuf, bool>, change: FsChange) {
    match change {
        FsChange::Upsert(path) => {
            pending.insert(path, false);
        }
        FsChange::Remove(path) => {
            pending.insert(path, true);
        }
    }
}

/// Unlink (explicit `delete_session`, a native remove event, or the
/// fallback poll discovering a vanished file): drop bookkeeping and emit
/// `deleted` exactly once, only if the path was tracked.
async fn handle_removed_path(
    path: &Path,
    sessions: &Arc<RwLock<HashMap<PathBuf, Tracked>>>,
    events_tx: &broadcast::Sender<WatcherEvent>,
) {
    if is_sub_session(path) {
        return;
    }
    let removed = sessions.write().await.remove(path);
    if let Some(tracked) = removed {
        let _ = events_tx.send(WatcherEvent::Deleted {
            session_id: tracked.state.session_id,
        });
    }
}

fn build_fs_watcher(
    projects_root: &Path,
    notify_tx: mpsc::Sender<FsChange>,
) -> notify::Result<RecommendedWatcher> {
    std::fs::create_dir_all(projects_root).ok();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let is_remove = matches!(event.kind, EventKind::Remove(_));
                if is_remove || matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    for path in event.paths {
                        if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                            let change = if is_remove {
                                FsChange::Remove(path)
                            } else {
                                FsChange::Upsert(path)
                            };
                            let _ = notify_tx.try_send(change);
                        }
                    }
                }
            }
        },
        notify::Config::default(),
    )?;
    watcher.watch(projects_root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

/// Handle one file's pending bytes: parse from the stored offset, update
/// bookkeeping, and emit `created`/`updated` when warranted.
async fn handle_path(
    path: &Path,
    sessions: &Arc<RwLock<HashMap<PathBuf, Tracked>>>,
    events_tx: &broadcast::Sender<WatcherEvent>,
) {
    if is_sub_session(path) {
        return;
    }

    let from_byte = {
        let sessions = sessions.read().await;
        sessions.get(path).map(|t| t.state.byte_position).unwrap_or(0)
    };

    let (new_entries, new_byte) = match parser::tail(path, from_byte).await {
        Ok(result) => result,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            tracing::debug!("transcript tail error for {:?}: {}", path, e);
            return;
        }
    };

    let is_first_parse = {
        let sessions = sessions.read().await;
        !sessions.contains_key(path)
    };

    let mut sessions_guard = sessions.write().await;
    let tracked = sessions_guard.entry(path.to_path_buf()).or_insert_with(|| Tracked {
        state: SessionState {
            session_id: parser::extract_session_id(path).unwrap_or_default(),
            filepath: path.to_path_buf(),
            byte_position: 0,
            cwd: None,
            git_branch: None,
            original_prompt: None,
            started_at: None,
            entries: Vec::new(),
            status: status::derive_status(&[], Utc::now()),
        },
        last_message_count: 0,
    });

    if is_first_parse {
        if let Some(ExtractedMetadata {
            session_id,
            cwd,
            git_branch,
            original_prompt,
            started_at,
        }) = parser::extract_metadata(&new_entries)
        {
            tracked.state.session_id = session_id;
            tracked.state.cwd = cwd;
            tracked.state.git_branch = git_branch;
            tracked.state.original_prompt = original_prompt;
            tracked.state.started_at = Some(started_at);
        }
    }

    tracked.state.entries.extend(new_entries);
    if tracked.state.entries.len() > MAX_ENTRIES_PER_SESSION {
        let overflow = tracked.state.entries.len() - MAX_ENTRIES_PER_SESSION;
        tracked.state.entries.drain(0..overflow);
    }
    tracked.state.byte_position = new_byte;

    let prev_status = tracked.state.status.status;
    let new_status = status::derive_status(&tracked.state.entries, Utc::now());
    let status_changed = new_status.status != prev_status;
    let message_count_grew = new_status.message_count > tracked.last_message_count;
    tracked.last_message_count = new_status.message_count;
    tracked.state.status = new_status;

    let snapshot = tracked.state.clone();
    drop(sessions_guard);

    if is_first_parse {
        let _ = events_tx.send(WatcherEvent::Created(snapshot));
    } else if status_changed || message_count_grew {
        let _ = events_tx.send(WatcherEvent::Updated(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use tokio::time::sleep;

    fn write_session_file(dir: &Path, session_id: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(format!("{}.jsonl", session_id));
        let mut file = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        path
    }

    #[tokio::test]
    async fn emits_created_then_updated_for_a_session() {
        let dir = TempDir::new().unwrap();
        let project_dir = dir.path().join("proj");
        std::fs::create_dir_all(&project_dir).unwrap();

        write_session_file(
            &project_dir,
            "sess-1",
            &[r#"{"type":"user","uuid":"u1","timestamp":"2026-01-01T00:00:00Z","sessionId":"sess-1","cwd":"/repo","message":{"content":"start"}}"#],
        );

        let watcher = spawn(dir.path().to_path_buf());
        let mut events = watcher.events();

        sleep(Duration::from_millis(600)).await;

        let first = events.recv().await.unwrap();
        assert!(matches!(first, WatcherEvent::Created(ref s) if s.session_id == "sess-1"));
    }

    #[test]
    fn sub_session_files_are_ignored() {
        let path = PathBuf::from("/tmp/proj/sess-1.agent-research.jsonl");
        assert!(is_sub_session(&path));
        let normal = PathBuf::from("/tmp/proj/sess-1.jsonl");
        assert!(!is_sub_session(&normal));
    }

    #[tokio::test]
    async fn unlinking_a_tracked_session_emits_deleted() {
        let dir = TempDir::new().unwrap();
        let project_dir = dir.path().join("proj");
        std::fs::create_dir_all(&project_dir).unwrap();

        let path = write_session_file(
            &project_dir,
            "sess-2",
            &[r#"{"type":"user","uuid":"u1","timestamp":"2026-01-01T00:00:00Z","sessionId":"sess-2","cwd":"/repo","message":{"content":"start"}}"#],
        );

        let watcher = spawn(dir.path().to_path_buf());
        let mut events = watcher.events();

        sleep(Duration::from_millis(600)).await;
        let created = events.recv().await.unwrap();
        assert!(matches!(created, WatcherEvent::Created(ref s) if s.session_id == "sess-2"));

        std::fs::remove_file(&path).unwrap();
        sleep(Duration::from_millis(600)).await;

        let deleted = events.recv().await.unwrap();
        assert!(matches!(deleted, WatcherEvent::Deleted { ref session_id } if session_id == "sess-2"));

        assert!(watcher.snapshot().await.is_empty());
    }
}
