// Gateway (component H): bidirectional message protocol, connection
// lifecycle, and dispatch to handlers, composing the Session Store,
// Subscription Manager, Ring-Buffer Manager, PTY Bridge, and Commander.
//
// Three axum routers share one `GatewayState`: a general event-stream
// WebSocket (`stream_port`), a plain HTTP API for session listing/creation
// (`api_port`), and a dedicated PTY-attach WebSocket (`pty_ws_port`). The
// message envelope is a tagged-JSON shape carried over
// `axum::extract::ws::Message::Text`.

pub mod protocol;

use crate::commander::{CommanderEvent, CommanderManager, CommanderStatus};
use crate::db::{outbox, Db};
use crate::error::DaemonError;
use crate::pty::{ClientId, PtyBridge, PtyEvent, PtyId, SpawnSpec};
use crate::ring_buffer::RingBufferManager;
use crate::store::{SessionStore, StoreEvent};
use crate::subscriptions::{Category, Scope, SubscriptionManager};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientMessage, ServerMessage, WireSession};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Outbound messages are queued per connection with this bound; once full,
/// the oldest queued message is dropped and the client is sent one
/// `warning{reason="backpressure"}`.
const OUTBOUND_QUEUE_CAP: usize = 256;
const FLEET_POLL_EVENTS: u32 = 50;

pub struct GatewayState {
    pub store: Arc<SessionStore>,
    pub pty: Arc<PtyBridge>,
    pub commander: Arc<CommanderManager>,
    pub db: Arc<Db>,
    pub ring: Arc<RingBufferManager<PtyEvent>>,
    subscriptions: StdMutex<SubscriptionManager<Uuid>>,
    outbound: StdMutex<HashMap<Uuid, mpsc::Sender<ServerMessage>>>,
    /// PTY ids with a ring-buffer pump already running, so the pump is
    /// started at most once per PTY regardless of how many clients attach.
    ring_pumped: StdMutex<HashSet<PtyId>>,
}

impl GatewayState {
    pub fn new(store: Arc<SessionStore>, pty: Arc<PtyBridge>, commander: Arc<CommanderManager>, db: Arc<Db>) -> Arc<Self> {
        let this = Arc::new(Self {
            store: Arc::clone(&store),
            pty,
            commander: Arc::clone(&commander),
            db: Arc::clone(&db),
            ring: Arc::new(RingBufferManager::new()),
            subscriptions: StdMutex::new(SubscriptionManager::new()),
            outbound: StdMutex::new(HashMap::new()),
            ring_pumped: StdMutex::new(HashSet::new()),
        });

        spawn_store_bridge(Arc::clone(&this), store);
        spawn_commander_bridge(Arc::clone(&this), commander);
        spawn_fleet_poll(Arc::clone(&this));

        this
    }

    fn register_connection(&self, conn: Uuid, sender: mpsc::Sender<ServerMessage>) {
        self.subscriptions.lock().unwrap().register(conn);
        self.outbound.lock().unwrap().insert(conn, sender);
    }

    fn unregister_connection(&self, conn: &Uuid) {
        self.subscriptions.lock().unwrap().unregister(conn);
        self.outbound.lock().unwrap().remove(conn);
    }

    /// Best-effort send with drop-oldest backpressure handling: a full
    /// bounded channel means the receiving task's own drain loop is behind,
    /// so the newest message always wins over the oldest queued one.
    fn send_to(&self, conn: &Uuid, message: ServerMessage) {
        let sender = self.outbound.lock().unwrap().get(conn).cloned();
        let Some(sender) = sender else { return };
        match sender.try_send(message.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = sender.try_send(ServerMessage::Warning {
                    reason: "backpressure".to_string(),
                });
                let _ = sender.try_send(message);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn broadcast(&self, category: &Category, message: ServerMessage) {
        let recipients = self.subscriptions.lock().unwrap().recipients(category);
        for conn in recipients {
            self.send_to(&conn, message.clone());
        }
    }
}

fn spawn_store_bridge(state: Arc<GatewayState>, store: Arc<SessionStore>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<StoreEvent>();
    store.subscribe(Box::new(move |event: &StoreEvent| {
        let _ = tx.send(event.clone());
    }));
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                StoreEvent::Discovered(session) => {
                    state.broadcast(
                        &Category::Lifecycle,
                        ServerMessage::SessionStatus {
                            session_id: session.session_id.clone(),
                            status: format!("{:?}", session.status).to_lowercase(),
                        },
                    );
                }
                StoreEvent::Updated { session_id, partial } => {
                    if let Some(status) = partial.status {
                        state.broadcast(
                            &Category::Session(&session_id),
                            ServerMessage::SessionStatus {
                                session_id: session_id.clone(),
                                status: format!("{:?}", status).to_lowercase(),
                            },
                        );
                    }
                }
                StoreEvent::Removed { session_id } => {
                    state.broadcast(
                        &Category::Lifecycle,
                        ServerMessage::SessionStatus {
                            session_id,
                            status: "removed".to_string(),
                        },
                    );
                }
            }
        }
    });
}

fn spawn_commander_bridge(state: Arc<GatewayState>, commander: Arc<CommanderManager>) {
    let mut rx = commander.events();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            };
            let message = match event {
                CommanderEvent::Queued { position } => ServerMessage::CommanderQueued { position },
                CommanderEvent::State { status } => ServerMessage::CommanderState {
                    status: commander_status_str(status),
                },
                CommanderEvent::SendFailed { reason } => ServerMessage::CommanderSendFailed { reason },
            };
            state.broadcast(&Category::Commander, message);
        }
    });
}

fn commander_status_str(status: CommanderStatus) -> String {
    match status {
        CommanderStatus::Idle => "idle",
        CommanderStatus::Working => "working",
        CommanderStatus::WaitingForInput => "waiting_for_input",
    }
    .to_string()
}

/// Delivers fleet activity to `fleet.subscribe`d connections. Outbox
/// inserts aren't pushed through an event bus of their own, so this polls
/// at a short fixed interval instead, matching the Transcript Watcher's own
/// fallback-poll precedent.
fn spawn_fleet_poll(state: Arc<GatewayState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let conns: Vec<(Uuid, i64)> = {
                let subs = state.subscriptions.lock().unwrap();
                state
                    .outbound
                    .lock()
                    .unwrap()
                    .keys()
                    .filter_map(|conn| {
                        let conn_state = subs.state(conn)?;
                        conn_state.fleet_subscribed.then(|| (*conn, conn_state.fleet_cursor))
                    })
                    .collect()
            };
            for (conn, cursor) in conns {
                let db = Arc::clone(&state.db);
                let events = db.interact(move |c| outbox::fetch_since(c, cursor, FLEET_POLL_EVENTS)).await;
                let Ok(events) = events else { continue };
                if events.is_empty() {
                    continue;
                }
                let new_cursor = events.last().map(|e| e.event_id).unwrap_or(cursor);
                for event in events {
                    state.send_to(
                        &conn,
                        ServerMessage::Event {
                            seq: event.event_id as u64,
                            event_type: event.event_type,
                            payload: event.payload_json,
                        },
                    );
                }
                state.subscriptions.lock().unwrap().set_fleet_cursor(&conn, new_cursor);
            }
        }
    });
}

pub fn build_stream_router(state: Arc<GatewayState>) -> Router {
    Router::new().route("/ws", get(stream_ws)).with_state(state)
}

pub fn build_pty_router(state: Arc<GatewayState>) -> Router {
    Router::new().route("/ws", get(pty_ws)).with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct CreatePtyRequest {
    pub cwd: String,
    pub command: Vec<String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}
fn default_cols() -> u16 {
    120
}
fn default_rows() -> u16 {
    40
}

pub fn build_api_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions", get(list_sessions))
        .route("/sessions/pty", post(create_pty_session))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_sessions(State(state): State<Arc<GatewayState>>) -> Json<Vec<WireSession>> {
    let sessions = state.store.snapshot().await;
    Json(sessions.iter().map(WireSession::from).collect())
}

async fn create_pty_session(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<CreatePtyRequest>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, String)> {
    let spec = SpawnSpec {
        cwd: req.cwd,
        command: req.command,
        env: Vec::new(),
        cols: req.cols,
        rows: req.rows,
    };
    let token = Uuid::new_v4().to_string();
    let (pty_id, pid) = state
        .pty
        .create(spec, token.clone())
        .await
        .map_err(|e| (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let session_id = pty_id.to_string();
    state
        .store
        .add_from_pty(&session_id, pid, crate::transcript::status::UiStatus::Working)
        .await;

    Ok(Json(serde_json::json!({ "sessionId": session_id, "token": token })))
}

async fn stream_ws(State(state): State<Arc<GatewayState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream_connection(socket, state))
}

async fn pty_ws(State(state): State<Arc<GatewayState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_pty_connection(socket, state))
}

/// The main event connection: session lifecycle/status, fleet replay, and
/// Commander control. Registers with scope `global`/`fleetSubscribed=false`,
/// loops decode/dispatch, unregisters on close.
async fn handle_stream_connection(socket: WebSocket, state: Arc<GatewayState>) {
    let conn_id = Uuid::new_v4();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE_CAP);
    state.register_connection(conn_id, out_tx);

    let (mut sink, mut stream) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else { continue };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else { continue };
        let Ok(client_message) = serde_json::from_str::<ClientMessage>(&text) else {
            continue;
        };
        dispatch_stream_message(&state, conn_id, client_message).await;
    }

    state.unregister_connection(&conn_id);
    send_task.abort();
}

async fn dispatch_stream_message(state: &Arc<GatewayState>, conn: Uuid, message: ClientMessage) {
    match message {
        ClientMessage::SessionsList => {
            let sessions = state.store.snapshot().await;
            state.send_to(
                &conn,
                ServerMessage::SessionsSnapshot {
                    sessions: sessions.iter().map(WireSession::from).collect(),
                },
            );
        }
        ClientMessage::Subscribe { session_id } => {
            state.subscriptions.lock().unwrap().subscribe(&conn, session_id);
        }
        ClientMessage::Unsubscribe { session_id } => {
            state.subscriptions.lock().unwrap().unsubscribe(&conn, &session_id);
        }
        ClientMessage::SetScope { scope } => {
            state.subscriptions.lock().unwrap().set_scope(&conn, Scope::from(scope));
        }
        ClientMessage::FleetSubscribe { from_cursor } => {
            state.subscriptions.lock().unwrap().fleet_subscribe(&conn, from_cursor);
        }
        ClientMessage::CommanderSend { prompt } => {
            if let Err(e) = state.commander.send_prompt(prompt).await {
                send_error(state, conn, e);
            }
        }
        ClientMessage::CommanderReset => {
            if let Err(e) = state.commander.reset().await {
                send_error(state, conn, DaemonError::CommanderSendFailed(e.to_string()));
            }
        }
        ClientMessage::CommanderCancel => {
            if let Err(e) = state.commander.cancel().await {
                send_error(state, conn, DaemonError::CommanderSendFailed(e.to_string()));
            }
        }
        ClientMessage::Ping => {
            state.send_to(&conn, ServerMessage::Pong);
        }
        // PTY control messages belong on the dedicated PTY connection.
        ClientMessage::PtyAttach { .. }
        | ClientMessage::PtyInput { .. }
        | ClientMessage::PtyResize { .. }
        | ClientMessage::PtySignal { .. } => {
            send_error(state, conn, DaemonError::BadState("pty messages require the pty connection".to_string()));
        }
    }
}

fn send_error(state: &Arc<GatewayState>, conn: Uuid, error: DaemonError) {
    state.send_to(
        &conn,
        ServerMessage::Error {
            code: error.code(),
            message: error.to_string(),
        },
    );
}

/// The PTY-attach connection: exactly one `pty.attach` binds the
/// connection to a PTY for its lifetime; after that, input/resize/signal
/// apply to the bound PTY and PTY output is streamed back as `job.*`.
async fn handle_pty_connection(socket: WebSocket, state: Arc<GatewayState>) {
    let conn_id = Uuid::new_v4();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE_CAP);
    state.register_connection(conn_id, out_tx.clone());

    let (mut sink, mut stream) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else { continue };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut bound: Option<(PtyId, String, ClientId)> = None;

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else { continue };
        let Ok(client_message) = serde_json::from_str::<ClientMessage>(&text) else {
            continue;
        };
        match client_message {
            ClientMessage::PtyAttach { session_id, token, from_seq } => {
                let Ok(pty_id) = session_id.parse::<PtyId>() else {
                    send_error(&state, conn_id, DaemonError::NotFound(session_id));
                    continue;
                };
                let client_id = Uuid::new_v4();
                match state.pty.add_client(pty_id, client_id, &token).await {
                    Ok(mut output_rx) => {
                        ensure_ring_pump(&state, pty_id, session_id.clone());
                        if let Some(from_seq) = from_seq {
                            for buffered in state.ring.get_from(&session_id, from_seq) {
                                send_pty_event(&state, conn_id, &session_id, buffered.event);
                            }
                        }
                        bound = Some((pty_id, session_id.clone(), client_id));
                        let forward_state = Arc::clone(&state);
                        let forward_session = session_id.clone();
                        let forward_conn = conn_id;
                        tokio::spawn(async move {
                            while let Ok(event) = output_rx.recv().await {
                                send_pty_event(&forward_state, forward_conn, &forward_session, event);
                            }
                        });
                    }
                    Err(e) => send_error(&state, conn_id, e),
                }
            }
            ClientMessage::PtyInput { bytes } => {
                if let Some((pty_id, _, _)) = &bound {
                    if let Err(e) = state.pty.write(*pty_id, bytes).await {
                        send_error(&state, conn_id, DaemonError::CommanderSendFailed(e.to_string()));
                    }
                }
            }
            ClientMessage::PtyResize { cols, rows } => {
                if let Some((pty_id, _, _)) = &bound {
                    let _ = state.pty.resize(*pty_id, cols, rows).await;
                }
            }
            ClientMessage::PtySignal { sig } => {
                if let Some((pty_id, _, _)) = &bound {
                    let _ = state.pty.signal(*pty_id, sig.into()).await;
                }
            }
            ClientMessage::Ping => state.send_to(&conn_id, ServerMessage::Pong),
            _ => send_error(&state, conn_id, DaemonError::BadState("non-pty message on pty connection".to_string())),
        }
    }

    if let Some((pty_id, _, client_id)) = bound {
        state.pty.remove_client(pty_id, client_id).await;
    }
    state.unregister_connection(&conn_id);
    send_task.abort();
}

/// Starts the single ring-buffer feed for a PTY, if one isn't already
/// running. Independent of client attachment: however many clients attach
/// or reconnect, each output chunk is pushed into the session's ring
/// exactly once.
fn ensure_ring_pump(state: &Arc<GatewayState>, pty_id: PtyId, session_id: String) {
    {
        let mut pumped = state.ring_pumped.lock().unwrap();
        if !pumped.insert(pty_id) {
            return;
        }
    }
    let pump_state = Arc::clone(state);
    tokio::spawn(async move {
        let mut output_rx = match pump_state.pty.subscribe(pty_id).await {
            Ok(rx) => rx,
            Err(_) => {
                pump_state.ring_pumped.lock().unwrap().remove(&pty_id);
                return;
            }
        };
        while let Ok(event) = output_rx.recv().await {
            pump_state.ring.push(&session_id, event.clone(), pty_event_size(&event));
        }
        pump_state.ring_pumped.lock().unwrap().remove(&pty_id);
    });
}

/// Sends a PTY event to one client's socket. Never touches the ring —
/// replaying buffered events (on `pty.attach{from_seq}`) and forwarding live
/// output both go through here, and neither should re-append to the ring
/// the event already occupies (or, for replay, already occupied).
fn send_pty_event(state: &Arc<GatewayState>, conn: Uuid, session_id: &str, event: PtyEvent) {
    let message = match event {
        PtyEvent::Output(bytes) => ServerMessage::JobOutput {
            session_id: session_id.to_string(),
            bytes,
        },
        PtyEvent::Exited { code, signal } => ServerMessage::JobExited {
            session_id: session_id.to_string(),
            code,
            signal,
        },
    };
    state.send_to(&conn, message);
}

fn pty_event_size(event: &PtyEvent) -> usize {
    match event {
        PtyEvent::Output(bytes) => bytes.len(),
        PtyEvent::Exited { .. } => 0,
    }
}
