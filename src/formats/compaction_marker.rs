// Compaction marker: `<cwd>/.claude/compacted.<newSessionId>.marker`
// containing `{newSessionId, cwd, compactedAt}`. Detected by the daemon,
// which emits a compaction event and deletes the marker; duplicate markers
// for the same predecessor within 60s are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DUPLICATE_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionMarker {
    #[serde(rename = "newSessionId")]
    pub new_session_id: String,
    pub cwd: String,
    #[serde(rename = "compactedAt")]
    pub compacted_at: DateTime<Utc>,
}

/// Basename must be `compacted.<newSessionId>.marker`; the embedded id is
/// cross-checked against the body's own `newSessionId` so a renamed or
/// hand-edited marker doesn't silently point at the wrong session.
pub fn parse_filename(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix("compacted.")?;
    rest.strip_suffix(".marker").map(str::to_string)
}

pub fn parse_body(raw: &str) -> Option<CompactionMarker> {
    serde_json::from_str(raw).ok()
}

pub fn is_duplicate(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_seen {
        Some(t) => now.signed_duration_since(t) < chrono::Duration::seconds(DUPLICATE_WINDOW_SECS),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parses_filename_id() {
        let path = PathBuf::from("/repo/.claude/compacted.sess-99.marker");
        assert_eq!(parse_filename(&path), Some("sess-99".to_string()));
    }

    #[test]
    fn non_marker_filename_yields_none() {
        let path = PathBuf::from("/repo/.claude/status.md");
        assert_eq!(parse_filename(&path), None);
    }

    #[test]
    fn parses_json_body() {
        let raw = r#"{"newSessionId":"sess-99","cwd":"/repo","compactedAt":"2026-01-01T00:00:00Z"}"#;
        let marker = parse_body(raw).unwrap();
        assert_eq!(marker.new_session_id, "sess-99");
    }

    #[test]
    fn duplicate_within_60s_window() {
        let now = Utc::now();
        assert!(is_duplicate(Some(now - chrono::Duration::seconds(10)), now));
        assert!(!is_duplicate(Some(now - chrono::Duration::seconds(120)), now));
        assert!(!is_duplicate(None, now));
    }
}
