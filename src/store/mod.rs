// Session Store (component E): unified tracking of sessions from multiple
// sources, source-of-truth for UI snapshots.
//
// Plain in-memory map behind a `tokio::sync::RwLock`, with a synchronous
// listener list — the "one-way event bus" design note made concrete as a
// `Vec<Box<dyn Fn(&StoreEvent)>>`: the Watcher emits, the Store subscribes,
// the Gateway subscribes to the Store. Nothing downstream holds a reference
// back to its producer beyond the subscription handle.

use crate::transcript::status::{StatusResult, UiStatus};
use crate::transcript::watcher::SessionState as WatcherSessionState;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Watcher,
    Pty,
}

/// File-derived status, reported separately from the live PTY/transcript
/// status machine — e.g. from `status.md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Working,
    WaitingForApproval,
    WaitingForInput,
    Completed,
    Error,
    Blocked,
    Idle,
}

impl FileStatus {
    /// Fixed mapping from file status to the UI-facing status, per the
    /// data model's Store invariant (b).
    fn to_ui(self) -> Option<UiStatus> {
        match self {
            FileStatus::WaitingForApproval | FileStatus::WaitingForInput | FileStatus::Blocked => {
                Some(UiStatus::Waiting)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackedSession {
    pub session_id: String,
    pub project_id: Option<String>,
    pub cwd: Option<String>,
    pub status: UiStatus,
    pub source: Source,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub git_branch: Option<String>,
    pub original_prompt: Option<String>,
    pub file_status: Option<FileStatus>,
    pub pid: Option<u32>,
    pub entries_count: usize,
}

#[derive(Debug, Clone)]
pub struct PartialUpdate {
    pub status: Option<UiStatus>,
    pub file_status: Option<FileStatus>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum StoreEvent {
    Discovered(TrackedSession),
    Updated {
        session_id: String,
        partial: PartialUpdate,
    },
    Removed {
        session_id: String,
    },
}

type Listener = Box<dyn Fn(&StoreEvent) + Send + Sync>;

pub struct SessionStore {
    sessions: RwLock<HashMap<String, TrackedSession>>,
    /// Tracks which ids have had a `Discovered` event emitted, so every
    /// `Removed` is guaranteed to follow a prior `Discovered`.
    discovered: RwLock<std::collections::HashSet<String>>,
    listeners: Mutex<Vec<Listener>>,
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            discovered: RwLock::new(std::collections::HashSet::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe(&self, listener: Listener) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Invoke every listener; one listener panicking must not prevent the
    /// rest from running.
    fn emit(&self, event: StoreEvent) {
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(&event)));
            if result.is_err() {
                tracing::warn!("session store listener panicked; continuing");
            }
        }
    }

    pub async fn snapshot(&self) -> Vec<TrackedSession> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn get(&self, session_id: &str) -> Option<TrackedSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Creates or updates from watcher data; preserves `source=pty` if
    /// already set, and preserves `createdAt`/`projectId`/`pid`/
    /// `fileStatus`.
    pub async fn add_from_watcher(&self, watcher_state: &WatcherSessionState) {
        let mut sessions = self.sessions.write().await;
        let is_new = !sessions.contains_key(&watcher_state.session_id);

        let entry = sessions
            .entry(watcher_state.session_id.clone())
            .or_insert_with(|| TrackedSession {
                session_id: watcher_state.session_id.clone(),
                project_id: None,
                cwd: watcher_state.cwd.clone(),
                status: watcher_state.status.status,
                source: Source::Watcher,
                last_activity_at: watcher_state
                    .status
                    .last_activity_at
                    .unwrap_or_else(Utc::now),
                created_at: watcher_state.started_at.unwrap_or_else(Utc::now),
                git_branch: watcher_state.git_branch.clone(),
                original_prompt: watcher_state.original_prompt.clone(),
                file_status: None,
                pid: None,
                entries_count: watcher_state.entries.len(),
            });

        let preserved_source = entry.source;
        entry.cwd = watcher_state.cwd.clone();
        entry.git_branch = watcher_state.git_branch.clone();
        entry.original_prompt = watcher_state.original_prompt.clone();
        entry.entries_count = watcher_state.entries.len();
        if preserved_source != Source::Pty {
            entry.status = watcher_state.status.status;
        }
        if let Some(t) = watcher_state.status.last_activity_at {
            entry.last_activity_at = t;
        }
        let snapshot = entry.clone();
        drop(sessions);

        self.mark_discovered_or_updated(is_new, snapshot).await;
    }

    /// Sets `source=pty`; preserves watcher-origin metadata if present.
    pub async fn add_from_pty(&self, session_id: &str, pid: Option<u32>, status: UiStatus) {
        let mut sessions = self.sessions.write().await;
        let is_new = !sessions.contains_key(session_id);

        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| TrackedSession {
                session_id: session_id.to_string(),
                project_id: None,
                cwd: None,
                status,
                source: Source::Pty,
                last_activity_at: Utc::now(),
                created_at: Utc::now(),
                git_branch: None,
                original_prompt: None,
                file_status: None,
                pid,
                entries_count: 0,
            });

        entry.source = Source::Pty;
        entry.pid = pid;
        entry.status = status;
        entry.last_activity_at = Utc::now();
        let snapshot = entry.clone();
        drop(sessions);

        self.mark_discovered_or_updated(is_new, snapshot).await;
    }

    /// No-op if session unknown; maps `fileStatus.status` to UI status via
    /// the fixed table.
    pub async fn update_file_status(&self, session_id: &str, file_status: FileStatus) {
        let snapshot = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(session_id) {
                Some(entry) => {
                    entry.file_status = Some(file_status);
                    if let Some(ui) = file_status.to_ui() {
                        entry.status = ui;
                    }
                    Some(entry.clone())
                }
                None => None,
            }
        };
        if let Some(snapshot) = snapshot {
            self.emit(StoreEvent::Updated {
                session_id: session_id.to_string(),
                partial: PartialUpdate {
                    status: Some(snapshot.status),
                    file_status: snapshot.file_status,
                    last_activity_at: Some(snapshot.last_activity_at),
                },
            });
        }
    }

    /// Ignores unknown ids; refreshes `lastActivityAt`.
    pub async fn update_status(&self, session_id: &str, status: UiStatus) {
        let now = Utc::now();
        let updated = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(session_id) {
                Some(entry) => {
                    entry.status = status;
                    entry.last_activity_at = now;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.emit(StoreEvent::Updated {
                session_id: session_id.to_string(),
                partial: PartialUpdate {
                    status: Some(status),
                    file_status: None,
                    last_activity_at: Some(now),
                },
            });
        }
    }

    pub async fn remove(&self, session_id: &str) {
        let existed = self.sessions.write().await.remove(session_id).is_some();
        if existed {
            self.emit(StoreEvent::Removed {
                session_id: session_id.to_string(),
            });
        }
    }

    async fn mark_discovered_or_updated(&self, is_new: bool, snapshot: TrackedSession) {
        if is_new {
            self.discovered.write().await.insert(snapshot.session_id.clone());
            self.emit(StoreEvent::Discovered(snapshot));
        } else {
            self.emit(StoreEvent::Updated {
                session_id: snapshot.session_id.clone(),
                partial: PartialUpdate {
                    status: Some(snapshot.status),
                    file_status: snapshot.file_status,
                    last_activity_at: Some(snapshot.last_activity_at),
                },
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::status::derive_status;

    fn watcher_state(session_id: &str) -> WatcherSessionState {
        WatcherSessionState {
            session_id: session_id.to_string(),
            filepath: std::path::PathBuf::from("/tmp/x.jsonl"),
            byte_position: 0,
            cwd: Some("/repo".to_string()),
            git_branch: None,
            original_prompt: None,
            started_at: Some(Utc::now()),
            entries: vec![],
            status: derive_status(&[], Utc::now()),
        }
    }

    #[tokio::test]
    async fn add_from_watcher_then_add_from_pty_preserves_metadata_and_upgrades_source() {
        let store = SessionStore::new();
        store.add_from_watcher(&watcher_state("s1")).await;
        store.add_from_pty("s1", Some(1234), UiStatus::Working).await;

        let session = store.get("s1").await.unwrap();
        assert_eq!(session.source, Source::Pty);
        assert_eq!(session.cwd.as_deref(), Some("/repo"));
        assert_eq!(session.pid, Some(1234));
    }

    #[tokio::test]
    async fn pty_source_dominates_on_conflicting_watcher_update() {
        let store = SessionStore::new();
        store.add_from_pty("s1", Some(1), UiStatus::Working).await;
        store.add_from_watcher(&watcher_state("s1")).await;

        let session = store.get("s1").await.unwrap();
        assert_eq!(session.source, Source::Pty);
    }

    #[tokio::test]
    async fn update_file_status_maps_to_waiting() {
        let store = SessionStore::new();
        store.add_from_pty("s1", None, UiStatus::Working).await;
        store.update_file_status("s1", FileStatus::WaitingForApproval).await;

        let session = store.get("s1").await.unwrap();
        assert_eq!(session.status, UiStatus::Waiting);
    }

    #[tokio::test]
    async fn update_status_on_unknown_session_is_a_noop() {
        let store = SessionStore::new();
        store.update_status("ghost", UiStatus::Idle).await;
        assert!(store.get("ghost").await.is_none());
    }

    #[tokio::test]
    async fn removed_always_follows_a_discovered() {
        let store = SessionStore::new();
        let events = Arc::new(Mutex::new(Vec::<String>::new()));
        let events_clone = Arc::clone(&events);
        store.subscribe(Box::new(move |event| {
            let label = match event {
                StoreEvent::Discovered(s) => format!("discovered:{}", s.session_id),
                StoreEvent::Updated { session_id, .. } => format!("updated:{}", session_id),
                StoreEvent::Removed { session_id } => format!("removed:{}", session_id),
            };
            events_clone.lock().unwrap().push(label);
        }));

        store.add_from_pty("s1", None, UiStatus::Working).await;
        store.remove("s1").await;

        let log = events.lock().unwrap();
        assert_eq!(log[0], "discovered:s1");
        assert_eq!(log[1], "removed:s1");
    }

    #[tokio::test]
    async fn a_panicking_listener_does_not_block_the_others() {
        let store = SessionStore::new();
        let fired = Arc::new(Mutex::new(false));
        let fired_clone = Arc::clone(&fired);

        store.subscribe(Box::new(|_event| panic!("boom")));
        store.subscribe(Box::new(move |_event| {
            *fired_clone.lock().unwrap() = true;
        }));

        store.add_from_pty("s1", None, UiStatus::Working).await;
        assert!(*fired.lock().unwrap());
    }
}
