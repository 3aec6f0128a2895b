// PTY Bridge (component D): spawns and supervises child processes under
// pseudo-terminals, relays bytes to/from Gateway clients, idle GC.
//
// Generalizes one-shell-per-task PTY ownership to a multi-client,
// token-gated, signal-capable bridge owned by a shared registry:
// `portable_pty` for allocation, one blocking reader/writer/wait thread per
// PTY (`portable_pty`'s `Read`/`Write` are synchronous, so these stay OS
// threads, not tokio tasks), a `tokio::sync::broadcast` channel for output
// fan-out, and `nix::sys::signal::kill` for `signal(id, sig)`.

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, RwLock};

pub type PtyId = u64;
pub type ClientId = uuid::Uuid;

const PTY_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub enum PtyEvent {
    Output(Vec<u8>),
    Exited { code: Option<i32>, signal: Option<i32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtySignal {
    Sigint,
    Sigterm,
    Sigkill,
}

impl PtySignal {
    fn to_nix(self) -> Signal {
        match self {
            PtySignal::Sigint => Signal::SIGINT,
            PtySignal::Sigterm => Signal::SIGTERM,
            PtySignal::Sigkill => Signal::SIGKILL,
        }
    }
}

pub struct SpawnSpec {
    pub cwd: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

struct PtyHandle {
    pty_id: PtyId,
    child_pid: Option<u32>,
    master: StdMutex<Box<dyn MasterPty + Send>>,
    input_tx: mpsc::Sender<Vec<u8>>,
    output_tx: broadcast::Sender<PtyEvent>,
    clients: StdMutex<HashSet<ClientId>>,
    last_activity: StdMutex<Instant>,
    /// Consumed on first matching `add_client` call; `None` once consumed,
    /// meaning the PTY no longer gates attachment.
    token: StdMutex<Option<String>>,
    alive: Arc<AtomicBool>,
}

impl PtyHandle {
    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }
}

pub struct PtyBridge {
    ptys: RwLock<HashMap<PtyId, Arc<PtyHandle>>>,
    next_id: AtomicU64,
}

impl PtyBridge {
    pub fn new() -> Arc<Self> {
        let bridge = Arc::new(Self {
            ptys: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });
        tokio::spawn(idle_sweep(Arc::clone(&bridge)));
        bridge
    }

    pub async fn create(&self, spec: SpawnSpec, token: String) -> Result<(PtyId, Option<u32>)> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let mut cmd = if spec.command.is_empty() {
            CommandBuilder::new("/bin/sh")
        } else {
            let mut c = CommandBuilder::new(&spec.command[0]);
            for arg in &spec.command[1..] {
                c.arg(arg);
            }
            c
        };
        cmd.cwd(&spec.cwd);
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .context("failed to spawn pty child")?;
        let child_pid = child.process_id();

        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(256);
        let (output_tx, _) = broadcast::channel::<PtyEvent>(1024);
        let alive = Arc::new(AtomicBool::new(true));

        let reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take pty writer")?;

        let pty_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(PtyHandle {
            pty_id,
            child_pid,
            master: StdMutex::new(pair.master),
            input_tx,
            output_tx: output_tx.clone(),
            clients: StdMutex::new(HashSet::new()),
            last_activity: StdMutex::new(Instant::now()),
            token: StdMutex::new(Some(token)),
            alive: Arc::clone(&alive),
        });

        spawn_reader_thread(reader, output_tx.clone(), Arc::clone(&handle), Arc::clone(&alive));
        spawn_writer_thread(writer, input_rx, Arc::clone(&alive));
        spawn_wait_thread(child, output_tx, Arc::clone(&alive));

        self.ptys.write().await.insert(pty_id, handle);
        Ok((pty_id, child_pid))
    }

    pub async fn write(&self, id: PtyId, bytes: Vec<u8>) -> Result<()> {
        let handle = self.get(id).await?;
        handle.touch();
        handle
            .input_tx
            .send(bytes)
            .await
            .context("pty writer channel closed")
    }

    pub async fn resize(&self, id: PtyId, cols: u16, rows: u16) -> Result<()> {
        let handle = self.get(id).await?;
        handle
            .master
            .lock()
            .unwrap()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to resize pty")
    }

    pub async fn signal(&self, id: PtyId, sig: PtySignal) -> Result<()> {
        let handle = self.get(id).await?;
        let pid = handle.child_pid.context("pty has no pid")?;
        nix::sys::signal::kill(Pid::from_raw(pid as i32), sig.to_nix())
            .context("failed to signal pty child")
    }

    pub async fn stop(&self, id: PtyId) {
        if let Some(handle) = self.ptys.write().await.remove(&id) {
            handle.alive.store(false, Ordering::SeqCst);
        }
    }

    /// One-shot token gate: succeeds if the stored token matches and
    /// consumes it, or if the token was already consumed by a prior
    /// attach. Registers `client` and returns a subscription to output.
    pub async fn add_client(
        &self,
        id: PtyId,
        client: ClientId,
        token: &str,
    ) -> Result<broadcast::Receiver<PtyEvent>, crate::error::DaemonError> {
        let handle = self
            .ptys
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| crate::error::DaemonError::NotFound(format!("pty {}", id)))?;

        {
            let mut stored = handle.token.lock().unwrap();
            match stored.as_deref() {
                Some(expected) if expected == token => {
                    *stored = None;
                }
                Some(_) => return Err(crate::error::DaemonError::BadToken),
                None => {}
            }
        }

        handle.clients.lock().unwrap().insert(client);
        handle.touch();
        Ok(handle.output_tx.subscribe())
    }

    pub async fn remove_client(&self, id: PtyId, client: ClientId) {
        if let Ok(handle) = self.get(id).await {
            handle.clients.lock().unwrap().remove(&client);
        }
    }

    /// Subscribe to a PTY's output without the client-token gate or client
    /// bookkeeping `add_client` does — for internal consumers (the Gateway's
    /// single ring-buffer pump) that need exactly one feed per PTY
    /// regardless of how many clients attach.
    pub async fn subscribe(&self, id: PtyId) -> Result<broadcast::Receiver<PtyEvent>, crate::error::DaemonError> {
        let handle = self.get(id).await?;
        Ok(handle.output_tx.subscribe())
    }

    async fn get(&self, id: PtyId) -> Result<Arc<PtyHandle>, crate::error::DaemonError> {
        self.ptys
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| crate::error::DaemonError::NotFound(format!("pty {}", id)))
    }

    /// Daemon shutdown: SIGTERM every live child, wait up to `timeout` for
    /// each to exit on its own (the wait thread flips `alive` to false and
    /// the registry entry is pruned), then SIGKILL whatever's still around.
    pub async fn shutdown_all(&self, timeout: Duration) {
        let ids: Vec<PtyId> = self.ptys.read().await.keys().copied().collect();
        for id in &ids {
            let _ = self.signal(*id, PtySignal::Sigterm).await;
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let remaining = self.ptys.read().await.values().any(|h| h.alive.load(Ordering::SeqCst));
            if !remaining {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for id in &ids {
            let _ = self.signal(*id, PtySignal::Sigkill).await;
        }
        for id in ids {
            self.stop(id).await;
        }
    }
}

fn spawn_reader_thread(
    mut reader: Box<dyn Read + Send>,
    output_tx: broadcast::Sender<PtyEvent>,
    handle: Arc<PtyHandle>,
    alive: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            if !alive.load(Ordering::SeqCst) {
                break;
            }
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    handle.touch();
                    let _ = output_tx.send(PtyEvent::Output(buf[..n].to_vec()));
                }
                Err(_) => break,
            }
        }
    });
}

fn spawn_writer_thread(
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    alive: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if !alive.load(Ordering::SeqCst) {
                break;
            }
            // A write failure on a dead master is terminal for the PTY.
            if writer.write_all(&data).is_err() {
                alive.store(false, Ordering::SeqCst);
                break;
            }
            let _ = writer.flush();
        }
    });
}

fn spawn_wait_thread(
    mut child: Box<dyn portable_pty::Child + Send>,
    output_tx: broadcast::Sender<PtyEvent>,
    alive: Arc<AtomicBool>,
) {
    std::thread::spawn(move || loop {
        if !alive.load(Ordering::SeqCst) {
            let _ = child.kill();
            break;
        }
        match child.try_wait() {
            Ok(Some(status)) => {
                alive.store(false, Ordering::SeqCst);
                let _ = output_tx.send(PtyEvent::Exited {
                    code: Some(status.exit_code() as i32),
                    signal: None,
                });
                break;
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(100)),
            Err(_) => {
                alive.store(false, Ordering::SeqCst);
                let _ = output_tx.send(PtyEvent::Exited { code: None, signal: None });
                break;
            }
        }
    });
}

async fn idle_sweep(bridge: Arc<PtyBridge>) {
    loop {
        tokio::time::sleep(IDLE_SWEEP_INTERVAL).await;
        let stale: Vec<PtyId> = {
            let ptys = bridge.ptys.read().await;
            ptys.values()
                .filter(|h| {
                    h.clients.lock().unwrap().is_empty()
                        && h.last_activity.lock().unwrap().elapsed() > PTY_IDLE_TIMEOUT
                })
                .map(|h| h.pty_id)
                .collect()
        };
        for id in stale {
            bridge.stop(id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: Vec<&str>) -> SpawnSpec {
        SpawnSpec {
            cwd: std::env::temp_dir().to_string_lossy().to_string(),
            command: command.into_iter().map(String::from).collect(),
            env: vec![],
            cols: 80,
            rows: 24,
        }
    }

    #[tokio::test]
    async fn create_write_and_exit_lifecycle() {
        let bridge = PtyBridge::new();
        let (id, pid) = bridge
            .create(spec(vec!["sh", "-c", "cat"]), "tok".to_string())
            .await
            .unwrap();
        assert!(pid.is_some());

        let client = uuid::Uuid::new_v4();
        let mut events = bridge.add_client(id, client, "tok").await.unwrap();

        bridge.write(id, b"hello\n".to_vec()).await.unwrap();

        let mut saw_output = false;
        for _ in 0..50 {
            match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
                Ok(Ok(PtyEvent::Output(data))) => {
                    if data.windows(5).any(|w| w == b"hello") {
                        saw_output = true;
                        break;
                    }
                }
                _ => continue,
            }
        }
        assert!(saw_output, "expected echoed output from cat");

        bridge.signal(id, PtySignal::Sigterm).await.unwrap();
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let bridge = PtyBridge::new();
        let (id, _) = bridge
            .create(spec(vec!["sh", "-c", "sleep 1"]), "correct".to_string())
            .await
            .unwrap();

        let client = uuid::Uuid::new_v4();
        let result = bridge.add_client(id, client, "wrong").await;
        assert!(matches!(result, Err(crate::error::DaemonError::BadToken)));
    }

    #[tokio::test]
    async fn token_is_one_shot() {
        let bridge = PtyBridge::new();
        let (id, _) = bridge
            .create(spec(vec!["sh", "-c", "sleep 1"]), "tok".to_string())
            .await
            .unwrap();

        let first = uuid::Uuid::new_v4();
        bridge.add_client(id, first, "tok").await.unwrap();

        // Second attach with no knowledge of the token (already consumed)
        // still succeeds.
        let second = uuid::Uuid::new_v4();
        bridge.add_client(id, second, "anything").await.unwrap();
    }

    #[tokio::test]
    async fn unknown_pty_id_is_not_found() {
        let bridge = PtyBridge::new();
        let result = bridge.write(9999, vec![]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn shutdown_all_terminates_children_and_empties_registry() {
        let bridge = PtyBridge::new();
        let (id, _) = bridge
            .create(spec(vec!["sh", "-c", "trap '' TERM; sleep 5"]), "tok".to_string())
            .await
            .unwrap();

        bridge.shutdown_all(Duration::from_millis(300)).await;

        assert!(bridge.get(id).await.is_err(), "pty should be pruned from the registry after shutdown");
    }
}
