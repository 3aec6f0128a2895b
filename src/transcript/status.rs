// Status Machine (component B): a pure function of (entries, now). No I/O,
// no shared state — this makes replay purity trivially true and lets the
// Watcher call it by simply re-running with a later `now` instead of
// running a separate timer subsystem.

use crate::transcript::entry::{ContentBlock, EntryBody, LogEntry, UserContent};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;

const STALE_TIMEOUT_SECS: i64 = 60;
const IDLE_TIMEOUT_SECS: i64 = 10 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Idle,
    WaitingForInput,
    Working,
    WaitingForApproval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiStatus {
    Working,
    Waiting,
    Idle,
}

impl MachineState {
    pub fn to_ui(self) -> UiStatus {
        match self {
            MachineState::Working => UiStatus::Working,
            MachineState::WaitingForInput | MachineState::WaitingForApproval => UiStatus::Waiting,
            MachineState::Idle => UiStatus::Idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResult {
    pub status: UiStatus,
    pub last_role: Option<Role>,
    pub has_pending_tool_use: bool,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub pending_tool_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

enum Event {
    UserPrompt,
    AssistantToolUse(Vec<String>),
    ToolResult(String),
    TurnEnd,
    /// Assistant text-only content: does not drive a transition by itself.
    AssistantStreaming,
}

fn derive_events(entry: &LogEntry) -> (Option<Role>, Vec<Event>) {
    match &entry.body {
        EntryBody::User(UserContent::Text(text)) if !text.trim().is_empty() => {
            (Some(Role::User), vec![Event::UserPrompt])
        }
        EntryBody::User(UserContent::Text(_)) => (Some(Role::User), vec![]),
        EntryBody::User(UserContent::ToolResults(results)) => {
            let events = results
                .iter()
                .map(|r| Event::ToolResult(r.tool_use_id.clone()))
                .collect();
            (Some(Role::User), events)
        }
        EntryBody::Assistant(blocks) => {
            let mut tool_ids = Vec::new();
            let mut has_text = false;
            for block in blocks {
                match block {
                    ContentBlock::ToolUse(tu) => tool_ids.push(tu.id.clone()),
                    ContentBlock::Text(_) => has_text = true,
                    ContentBlock::Thinking(_) => {}
                }
            }
            let mut events = Vec::new();
            if !tool_ids.is_empty() {
                events.push(Event::AssistantToolUse(tool_ids));
            } else if has_text {
                events.push(Event::AssistantStreaming);
            }
            (Some(Role::Assistant), events)
        }
        EntryBody::System { subtype } => {
            let events = if subtype == "turn_duration" || subtype == "stop_hook_summary" {
                vec![Event::TurnEnd]
            } else {
                vec![]
            };
            (Some(Role::System), events)
        }
        EntryBody::Other => (None, vec![]),
    }
}

/// Pure replay of the full entry list, followed by time-based transitions
/// evaluated against `now`. An implementation MAY memoize by last consumed
/// index since replay is deterministic, but this function never needs to —
/// it recomputes the whole thing and is still O(entries) per call.
pub fn derive_status(entries: &[LogEntry], now: DateTime<Utc>) -> StatusResult {
    let mut state = MachineState::Idle;
    let mut pending: BTreeSet<String> = BTreeSet::new();
    let mut last_role = None;
    let mut last_activity_at: Option<DateTime<Utc>> = None;
    let mut message_count: u64 = 0;
    let mut state_entered_at: Option<DateTime<Utc>> = None;

    for entry in entries {
        let (role, events) = derive_events(entry);
        if role.is_some() {
            last_role = role;
        }
        if last_activity_at.map_or(true, |t| entry.timestamp > t) {
            last_activity_at = Some(entry.timestamp);
        }

        for event in events {
            let prev_state = state;
            match (state, event) {
                (_, Event::UserPrompt) => {
                    state = MachineState::Working;
                    message_count += 1;
                }
                (MachineState::WaitingForApproval, Event::AssistantToolUse(ids)) => {
                    pending.extend(ids);
                    message_count += 1;
                }
                (_, Event::AssistantToolUse(ids)) => {
                    pending = ids.into_iter().collect();
                    state = MachineState::WaitingForApproval;
                    message_count += 1;
                }
                (MachineState::WaitingForApproval, Event::ToolResult(id)) => {
                    pending.remove(&id);
                    message_count += 1;
                    if pending.is_empty() {
                        state = MachineState::Working;
                    }
                }
                (_, Event::ToolResult(_)) => {
                    message_count += 1;
                }
                (MachineState::Working, Event::TurnEnd) => {
                    state = MachineState::WaitingForInput;
                }
                (_, Event::TurnEnd) => {}
                (_, Event::AssistantStreaming) => {}
            }
            if state != prev_state {
                state_entered_at = Some(entry.timestamp);
            }
        }
    }

    // Time-based transitions, evaluated against `now` rather than a timer.
    // Anchored on the last activity timestamp so STALE_TIMEOUT and
    // IDLE_TIMEOUT cascade in one evaluation (working -> waiting_for_input
    // -> idle) instead of requiring two separate calls.
    if let Some(anchor) = last_activity_at.or(state_entered_at) {
        let elapsed = now.signed_duration_since(anchor);
        if state == MachineState::Working && elapsed >= Duration::seconds(STALE_TIMEOUT_SECS) {
            state = MachineState::WaitingForInput;
        }
        if matches!(
            state,
            MachineState::WaitingForInput | MachineState::WaitingForApproval
        ) && elapsed >= Duration::seconds(IDLE_TIMEOUT_SECS)
        {
            state = MachineState::Idle;
        }
    }

    StatusResult {
        status: state.to_ui(),
        last_role,
        has_pending_tool_use: state == MachineState::WaitingForApproval,
        last_activity_at,
        message_count,
        pending_tool_ids: pending.into_iter().collect(),
    }
}
