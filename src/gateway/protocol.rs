// Gateway wire protocol: a tagged JSON envelope carried over
// `axum::extract::ws::Message::Text`, one message per WebSocket frame.

use crate::error::DaemonErrorCode;
use crate::store::TrackedSession;
use crate::subscriptions::Scope;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SessionsList,
    Subscribe { session_id: String },
    Unsubscribe { session_id: String },
    SetScope { scope: WireScope },
    FleetSubscribe { from_cursor: i64 },
    PtyAttach { session_id: String, token: String, from_seq: Option<u64> },
    PtyInput { bytes: Vec<u8> },
    PtyResize { cols: u16, rows: u16 },
    PtySignal { sig: WireSignal },
    CommanderSend { prompt: String },
    CommanderReset,
    CommanderCancel,
    Ping,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireScope {
    Global,
    Session,
    Observer,
}

impl From<WireScope> for Scope {
    fn from(value: WireScope) -> Self {
        match value {
            WireScope::Global => Scope::Global,
            WireScope::Session => Scope::Session,
            WireScope::Observer => Scope::Observer,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireSignal {
    Sigint,
    Sigterm,
    Sigkill,
}

impl From<WireSignal> for crate::pty::PtySignal {
    fn from(value: WireSignal) -> Self {
        match value {
            WireSignal::Sigint => crate::pty::PtySignal::Sigint,
            WireSignal::Sigterm => crate::pty::PtySignal::Sigterm,
            WireSignal::Sigkill => crate::pty::PtySignal::Sigkill,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionsSnapshot { sessions: Vec<WireSession> },
    SessionStatus { session_id: String, status: String },
    Event { seq: u64, event_type: String, payload: String },
    CommanderQueued { position: usize },
    CommanderState { status: String },
    CommanderSendFailed { reason: String },
    JobOutput { session_id: String, bytes: Vec<u8> },
    JobExited { session_id: String, code: Option<i32>, signal: Option<i32> },
    Error { code: DaemonErrorCode, message: String },
    Warning { reason: String },
    Pong,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireSession {
    pub session_id: String,
    pub cwd: Option<String>,
    pub status: String,
    pub original_prompt: Option<String>,
}

impl From<&TrackedSession> for WireSession {
    fn from(session: &TrackedSession) -> Self {
        Self {
            session_id: session.session_id.clone(),
            cwd: session.cwd.clone(),
            status: format!("{:?}", session.status).to_lowercase(),
            original_prompt: session.original_prompt.clone(),
        }
    }
}
