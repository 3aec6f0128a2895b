// The tagged record that transcript JSONL lines deserialize into.
//
// Parsing never throws: `LogEntry::from_json` returns `None` for a
// malformed or unrecognized line, matching the "parsers yield Option<Entry>
// for unknown variants, never throw" design note. Unknown `type` values are
// kept as `EntryBody::Other` rather than rejected, since the transcript
// format is produced by a process this daemon does not control.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultRef {
    pub tool_use_id: String,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserContent {
    Text(String),
    ToolResults(Vec<ToolResultRef>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    ToolUse(ToolUse),
    Thinking(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryBody {
    User(UserContent),
    Assistant(Vec<ContentBlock>),
    System { subtype: String },
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub uuid: String,
    pub session_id: String,
    pub cwd: Option<String>,
    pub git_branch: Option<String>,
    pub body: EntryBody,
}

impl LogEntry {
    /// Parse one JSONL line. Returns `None` on any structural mismatch —
    /// the caller drops the line and continues, per the transcript format
    /// contract (`tail` never aborts a batch over one bad line).
    pub fn from_line(line: &str) -> Option<Self> {
        if line.trim().is_empty() {
            return None;
        }
        let value: Value = serde_json::from_str(line).ok()?;
        Self::from_json(&value)
    }

    fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let kind = obj.get("type")?.as_str()?;
        let timestamp = obj
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))?;
        let uuid = obj.get("uuid").and_then(Value::as_str)?.to_string();
        let session_id = obj.get("sessionId").and_then(Value::as_str)?.to_string();
        let cwd = obj.get("cwd").and_then(Value::as_str).map(str::to_string);
        let git_branch = obj
            .get("gitBranch")
            .and_then(Value::as_str)
            .map(str::to_string);

        let body = match kind {
            "user" => EntryBody::User(parse_user_content(obj.get("message"))?),
            "assistant" => EntryBody::Assistant(parse_assistant_blocks(obj.get("message"))?),
            "system" => EntryBody::System {
                subtype: obj
                    .get("subtype")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => EntryBody::Other,
        };

        Some(LogEntry {
            timestamp,
            uuid,
            session_id,
            cwd,
            git_branch,
            body,
        })
    }
}

fn parse_user_content(message: Option<&Value>) -> Option<UserContent> {
    let content = message?.get("content")?;
    if let Some(text) = content.as_str() {
        return Some(UserContent::Text(text.to_string()));
    }
    if let Some(items) = content.as_array() {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            if item.get("type").and_then(Value::as_str) != Some("tool_result") {
                continue;
            }
            let tool_use_id = item.get("tool_use_id")?.as_str()?.to_string();
            let content = item.get("content").cloned().unwrap_or(Value::Null);
            results.push(ToolResultRef {
                tool_use_id,
                content,
            });
        }
        return Some(UserContent::ToolResults(results));
    }
    None
}

fn parse_assistant_blocks(message: Option<&Value>) -> Option<Vec<ContentBlock>> {
    let items = message?.get("content")?.as_array()?;
    let mut blocks = Vec::with_capacity(items.len());
    for item in items {
        match item.get("type").and_then(Value::as_str) {
            Some("text") => {
                let text = item.get("text").and_then(Value::as_str)?.to_string();
                blocks.push(ContentBlock::Text(text));
            }
            Some("tool_use") => {
                let id = item.get("id")?.as_str()?.to_string();
                let name = item.get("name")?.as_str()?.to_string();
                let input = item.get("input").cloned().unwrap_or(Value::Null);
                blocks.push(ContentBlock::ToolUse(ToolUse { id, name, input }));
            }
            Some("thinking") => {
                let text = item
                    .get("thinking")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                blocks.push(ContentBlock::Thinking(text));
            }
            _ => continue,
        }
    }
    Some(blocks)
}
