// Typed errors that cross a component boundary and carry a stable wire code.
//
// Internal wiring (config load, DB open, file I/O during startup) uses
// anyhow::Result; anything that reaches a Gateway client is wrapped in
// DaemonError so it serializes to `error{code, message}` per the gateway
// protocol.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DaemonErrorCode {
    NotFound,
    BadToken,
    BadState,
    CommanderBusy,
    CommanderSendFailed,
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad token")]
    BadToken,
    #[error("bad state: {0}")]
    BadState(String),
    #[error("commander busy")]
    CommanderBusy,
    #[error("commander send failed: {0}")]
    CommanderSendFailed(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
}

impl DaemonError {
    pub fn code(&self) -> DaemonErrorCode {
        match self {
            DaemonError::NotFound(_) => DaemonErrorCode::NotFound,
            DaemonError::BadToken => DaemonErrorCode::BadToken,
            DaemonError::BadState(_) => DaemonErrorCode::BadState,
            DaemonError::CommanderBusy => DaemonErrorCode::CommanderBusy,
            DaemonError::CommanderSendFailed(_) => DaemonErrorCode::CommanderSendFailed,
            DaemonError::Timeout(_) => DaemonErrorCode::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_maps_to_screaming_snake_case_on_the_wire() {
        let err = DaemonError::CommanderSendFailed("pty closed".into());
        let json = serde_json::to_string(&err.code()).unwrap();
        assert_eq!(json, "\"COMMANDER_SEND_FAILED\"");
    }
}
