// Commander Session Manager (component I): the one privileged PTY session
// that runs the fleet-orchestrating `claude` conversation itself. Reuses
// the PTY Bridge for the actual process instead of re-implementing PTY
// plumbing, and learns its own status the same way the Gateway would — by
// subscribing to the Session Store like any other listener, never by
// reaching back into the Transcript Watcher directly. That keeps the
// one-way event bus intact: Watcher -> Store -> {Gateway, Commander}.

use crate::db::conversation::{self, Conversation, ConversationKind};
use crate::db::outbox;
use crate::db::Db;
use crate::error::DaemonError;
use crate::pty::{PtyBridge, PtyId, PtySignal, SpawnSpec};
use crate::store::{SessionStore, StoreEvent};
use crate::transcript::status::UiStatus;
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};

/// Fleet prelude is capped at this many outbox events per turn.
const MAX_FLEET_EVENTS: u32 = 50;
/// How long the session-id capture sweep keeps polling before giving up.
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(180);
const CAPTURE_POLL_INTERVAL: Duration = Duration::from_millis(300);

const COMMANDER_SYSTEM_PROMPT: &str = "\
You are the fleet commander. You can see status updates from worker \
sessions as they report briefings; use them to decide what to do next. \
You do not need to repeat them back to the user unless asked.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommanderStatus {
    Idle,
    Working,
    WaitingForInput,
}

#[derive(Debug, Clone)]
pub enum CommanderEvent {
    Queued { position: usize },
    State { status: CommanderStatus },
    SendFailed { reason: String },
}

struct Inner {
    pty_id: Option<PtyId>,
    status: CommanderStatus,
    queue: VecDeque<String>,
    is_first_turn: bool,
    is_draining: bool,
    conversation: Conversation,
}

pub struct CommanderManager {
    db: Arc<Db>,
    pty: Arc<PtyBridge>,
    cwd: String,
    cli_command: Vec<String>,
    projects_root: PathBuf,
    inner: Mutex<Inner>,
    events_tx: broadcast::Sender<CommanderEvent>,
}

impl CommanderManager {
    /// Loads (or creates) the singleton Commander conversation row and
    /// wires up a Session Store subscription, but does not spawn a PTY —
    /// that only happens lazily on the first `send_prompt`. If a prior
    /// run already captured a `claudeSessionId`, the next spawn resumes it
    /// and starts with `is_first_turn = false`.
    pub async fn spawn(
        db: Arc<Db>,
        pty: Arc<PtyBridge>,
        store: Arc<SessionStore>,
        cwd: String,
        cli_command: Vec<String>,
        projects_root: PathBuf,
    ) -> Result<Arc<Self>> {
        let cwd_for_conv = cwd.clone();
        let conversation = db
            .interact(move |conn| conversation::get_or_create(conn, ConversationKind::Commander, &cwd_for_conv, "default"))
            .await
            .context("failed to load commander conversation")?;
        let is_first_turn = conversation.claude_session_id.is_none();

        let (events_tx, _) = broadcast::channel(256);
        let this = Arc::new(Self {
            db,
            pty,
            cwd,
            cli_command,
            projects_root,
            inner: Mutex::new(Inner {
                pty_id: None,
                status: CommanderStatus::Idle,
                queue: VecDeque::new(),
                is_first_turn,
                is_draining: false,
                conversation,
            }),
            events_tx,
        });

        let (tx, rx) = mpsc::unbounded_channel::<StoreEvent>();
        store.subscribe(Box::new(move |event: &StoreEvent| {
            let _ = tx.send(event.clone());
        }));
        let listener = Arc::clone(&this);
        tokio::spawn(async move { listener.run_event_loop(rx).await });

        Ok(this)
    }

    pub fn events(&self) -> broadcast::Receiver<CommanderEvent> {
        self.events_tx.subscribe()
    }

    pub async fn status(&self) -> CommanderStatus {
        self.inner.lock().await.status
    }

    /// A prompt is either written immediately (status was not `working`) or
    /// queued (status was `working`) — never both, and never written while
    /// `working`. The state check and the status flip to
    /// `working` happen under one lock acquisition so two concurrent calls
    /// can't both observe a non-working status and both write.
    pub async fn send_prompt(self: &Arc<Self>, prompt: String) -> Result<(), DaemonError> {
        let pty_id = self
            .ensure_pty()
            .await
            .map_err(|e| DaemonError::CommanderSendFailed(e.to_string()))?;

        let mut inner = self.inner.lock().await;
        if inner.status == CommanderStatus::Working {
            inner.queue.push_back(prompt);
            let position = inner.queue.len();
            drop(inner);
            let _ = self.events_tx.send(CommanderEvent::Queued { position });
            return Ok(());
        }
        inner.status = CommanderStatus::Working;
        drop(inner);

        self.write_prompt(pty_id, prompt).await
    }

    pub async fn reset(self: &Arc<Self>) -> Result<()> {
        let (pty_id, conversation_id) = {
            let mut inner = self.inner.lock().await;
            inner.queue.clear();
            inner.is_first_turn = true;
            inner.status = CommanderStatus::Idle;
            inner.conversation.claude_session_id = None;
            (inner.pty_id.take(), inner.conversation.conversation_id.clone())
        };

        if let Some(id) = pty_id {
            self.pty.stop(id).await;
        }

        let db = Arc::clone(&self.db);
        db.interact(move |conn| conversation::clear_claude_session_id(conn, &conversation_id))
            .await
            .context("failed to clear commander session id on reset")?;

        let _ = self.events_tx.send(CommanderEvent::State {
            status: CommanderStatus::Idle,
        });
        Ok(())
    }

    pub async fn cancel(&self) -> Result<()> {
        let pty_id = self.inner.lock().await.pty_id;
        if let Some(id) = pty_id {
            self.pty.signal(id, PtySignal::Sigint).await?;
        }
        Ok(())
    }

    async fn ensure_pty(self: &Arc<Self>) -> Result<PtyId> {
        let mut inner = self.inner.lock().await;
        if let Some(id) = inner.pty_id {
            return Ok(id);
        }

        let mut command = self.cli_command.clone();
        command.push("--dangerously-skip-permissions".to_string());
        let needs_capture = inner.conversation.claude_session_id.is_none();
        if let Some(session_id) = inner.conversation.claude_session_id.clone() {
            command.push("--resume".to_string());
            command.push(session_id);
        }

        let spec = SpawnSpec {
            cwd: self.cwd.clone(),
            command,
            env: Vec::new(),
            cols: 120,
            rows: 40,
        };
        let token = uuid::Uuid::new_v4().to_string();
        let (pty_id, _pid) = self.pty.create(spec, token).await?;
        inner.pty_id = Some(pty_id);
        drop(inner);

        if needs_capture {
            self.spawn_session_capture_task();
        }

        Ok(pty_id)
    }

    /// Builds the fleet prelude from undelivered outbox events, writes the
    /// preamble + prompt to the PTY, and commits the new cursor. The
    /// first-turn system prompt and the fleet-activity reminder are two
    /// independent conditions — a first turn with no fleet activity yet
    /// gets only the former, a later turn with fresh briefings gets only
    /// the latter, and both can apply together.
    async fn write_prompt(&self, pty_id: PtyId, prompt: String) -> Result<(), DaemonError> {
        let (conversation_id, cursor, is_first_turn) = {
            let inner = self.inner.lock().await;
            (
                inner.conversation.conversation_id.clone(),
                inner.conversation.last_outbox_event_id_seen,
                inner.is_first_turn,
            )
        };

        let db = Arc::clone(&self.db);
        let events = db
            .interact(move |conn| outbox::fetch_since(conn, cursor, MAX_FLEET_EVENTS))
            .await
            .map_err(|e| DaemonError::CommanderSendFailed(e.to_string()))?;

        let new_cursor = events.last().map(|e| e.event_id).unwrap_or(cursor);
        let fleet_delta = render_fleet_delta(&events);
        let has_activity = !fleet_delta.trim().is_empty();

        let mut preamble = String::new();
        if is_first_turn {
            preamble.push_str(&format!("<system-reminder>\n{}\n</system-reminder>\n\n", COMMANDER_SYSTEM_PROMPT));
        }
        if has_activity {
            preamble.push_str(&format!("<system-reminder>\n{}\n</system-reminder>\n\n", fleet_delta));
        }

        let full = format!("{}{}\n", preamble, prompt);
        self.pty
            .write(pty_id, full.into_bytes())
            .await
            .map_err(|e| DaemonError::CommanderSendFailed(e.to_string()))?;

        if new_cursor != cursor {
            let conv_id = conversation_id.clone();
            let db = Arc::clone(&self.db);
            let _ = db
                .interact(move |conn| conversation::set_cursor(conn, &conv_id, new_cursor))
                .await;
        }

        let mut inner = self.inner.lock().await;
        inner.is_first_turn = false;
        inner.conversation.last_outbox_event_id_seen = new_cursor;
        Ok(())
    }

    async fn run_event_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<StoreEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_store_event(event).await;
        }
    }

    /// Only events about the session we actually bound to (the captured
    /// `claudeSessionId`) move the Commander's own status or wake the
    /// queue — everything else on the bus is ignored.
    async fn handle_store_event(self: &Arc<Self>, event: StoreEvent) {
        let (session_id, status) = match event {
            StoreEvent::Discovered(session) => (session.session_id, session.status),
            StoreEvent::Updated { session_id, partial } => match partial.status {
                Some(status) => (session_id, status),
                None => return,
            },
            StoreEvent::Removed { .. } => return,
        };

        let bound = { self.inner.lock().await.conversation.claude_session_id.clone() };
        if bound.as_deref() != Some(session_id.as_str()) {
            return;
        }

        let commander_status = match status {
            UiStatus::Working => CommanderStatus::Working,
            UiStatus::Waiting => CommanderStatus::WaitingForInput,
            UiStatus::Idle => CommanderStatus::Idle,
        };

        let should_drain = {
            let mut inner = self.inner.lock().await;
            inner.status = commander_status;
            commander_status != CommanderStatus::Working && !inner.queue.is_empty()
        };

        let _ = self.events_tx.send(CommanderEvent::State { status: commander_status });

        if should_drain {
            self.drain_queue().await;
        }
    }

    async fn drain_queue(self: &Arc<Self>) {
        let (pty_id, next) = {
            let mut inner = self.inner.lock().await;
            if inner.is_draining {
                return;
            }
            let next = match inner.queue.pop_front() {
                Some(p) => p,
                None => return,
            };
            let pty_id = match inner.pty_id {
                Some(id) => id,
                None => return,
            };
            inner.is_draining = true;
            inner.status = CommanderStatus::Working;
            (pty_id, next)
        };

        let result = self.write_prompt(pty_id, next).await;

        let mut inner = self.inner.lock().await;
        inner.is_draining = false;
        if let Err(e) = result {
            let _ = self.events_tx.send(CommanderEvent::SendFailed { reason: e.to_string() });
        }
    }

    /// Polls `~/.claude/projects/<encoded cwd>/` for the transcript file
    /// claude creates for this conversation, since the CLI never reports
    /// its own session id back over the PTY. Stops as soon as one is found
    /// or another caller (e.g. a concurrent reset) already set one.
    fn spawn_session_capture_task(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let dir = this.projects_root.join(encode_cwd(&this.cwd));
            let deadline = tokio::time::Instant::now() + CAPTURE_TIMEOUT;
            loop {
                {
                    let inner = this.inner.lock().await;
                    if inner.conversation.claude_session_id.is_some() {
                        return;
                    }
                }
                if let Some(found) = sweep_latest_session_id(&dir) {
                    let mut inner = this.inner.lock().await;
                    if inner.conversation.claude_session_id.is_none() {
                        inner.conversation.claude_session_id = Some(found.clone());
                        let conversation_id = inner.conversation.conversation_id.clone();
                        drop(inner);
                        let db = Arc::clone(&this.db);
                        let _ = db
                            .interact(move |conn| conversation::set_claude_session_id(conn, &conversation_id, &found))
                            .await;
                    }
                    return;
                }
                if tokio::time::Instant::now() >= deadline {
                    return;
                }
                tokio::time::sleep(CAPTURE_POLL_INTERVAL).await;
            }
        });
    }
}

fn render_fleet_delta(events: &[outbox::OutboxEvent]) -> String {
    let mut out = String::new();
    for event in events {
        out.push_str(&format!("- [{}] {}\n", event.event_type, event.payload_json));
    }
    out
}

/// Claude's project directory naming: `/` and `.` in the cwd become `-`.
fn encode_cwd(cwd: &str) -> String {
    cwd.chars().map(|c| if c == '/' || c == '.' { '-' } else { c }).collect()
}

fn sweep_latest_session_id(dir: &Path) -> Option<String> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|e| e.to_str()) == Some("jsonl"))
        .filter_map(|entry| entry.path().file_stem().and_then(|s| s.to_str()).map(|s| s.to_string()))
        .filter(|stem| !stem.contains(".agent-"))
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn manager() -> (Arc<CommanderManager>, Arc<SessionStore>, tempfile::TempDir) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let pty = PtyBridge::new();
        let store = SessionStore::new();
        let tmp = tempdir().unwrap();
        let manager = CommanderManager::spawn(
            db,
            pty,
            Arc::clone(&store),
            "/repo".to_string(),
            vec!["cat".to_string()],
            tmp.path().to_path_buf(),
        )
        .await
        .unwrap();
        (manager, store, tmp)
    }

    #[tokio::test]
    async fn first_send_prompt_spawns_pty_and_goes_working() {
        let (commander, _store, _tmp) = manager().await;
        commander.send_prompt("hello".to_string()).await.unwrap();
        assert_eq!(commander.status().await, CommanderStatus::Working);
    }

    // A second prompt sent while working is queued, not written, and drains
    // automatically once the bound session reports waiting.
    #[tokio::test]
    async fn prompt_sent_while_working_is_queued_then_drains_on_waiting() {
        let (commander, store, _tmp) = manager().await;
        commander.send_prompt("first".to_string()).await.unwrap();

        let mut events = commander.events();
        commander.send_prompt("second".to_string()).await.unwrap();
        match events.recv().await.unwrap() {
            CommanderEvent::Queued { position } => assert_eq!(position, 1),
            other => panic!("expected Queued, got {:?}", other),
        }

        // Simulate the Transcript Watcher -> Store reporting this session
        // as captured and now waiting for input.
        let session_id = {
            let inner = commander.inner.lock().await;
            inner.conversation.claude_session_id.clone()
        };
        assert!(session_id.is_none(), "no claudeSessionId captured yet with a fake command");

        // Manually bind a session id the way the capture sweep would, then
        // push the store event that should trigger a drain.
        {
            let mut inner = commander.inner.lock().await;
            inner.conversation.claude_session_id = Some("sess-1".to_string());
        }
        store.add_from_pty("sess-1", None, UiStatus::Waiting).await;

        crate::test_utils::assert_eventually_bool(
            "queue to drain after session reports waiting",
            Duration::from_secs(1),
            Duration::from_millis(20),
            || async { commander.inner.lock().await.queue.is_empty() },
        )
        .await;
    }

    #[tokio::test]
    async fn reset_clears_queue_and_session_binding() {
        let (commander, _store, _tmp) = manager().await;
        commander.send_prompt("first".to_string()).await.unwrap();
        commander.send_prompt("second".to_string()).await.unwrap();

        commander.reset().await.unwrap();

        let inner = commander.inner.lock().await;
        assert!(inner.queue.is_empty());
        assert!(inner.conversation.claude_session_id.is_none());
        assert!(inner.is_first_turn);
        assert_eq!(inner.pty_id, None);
    }

    #[test]
    fn encode_cwd_replaces_slashes_and_dots() {
        assert_eq!(encode_cwd("/Users/a.b/repo"), "-Users-a-b-repo");
    }

    #[test]
    fn sweep_latest_session_id_picks_lexicographic_max_and_skips_sub_sessions() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join("aaa.jsonl"), "").unwrap();
        std::fs::write(tmp.path().join("zzz.jsonl"), "").unwrap();
        std::fs::write(tmp.path().join("zzz.agent-1.jsonl"), "").unwrap();
        assert_eq!(sweep_latest_session_id(tmp.path()), Some("zzz".to_string()));
    }
}
