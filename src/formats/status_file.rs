// Status file format (`<cwd>/.claude/status.md`): YAML frontmatter then a
// markdown body, the same shape as status.v5 but a much smaller schema and
// a freshness rule — a status older than STATUS_FILE_TTL_MS is treated as
// absent.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const STATUS_FILE_TTL_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatusKind {
    Working,
    WaitingForApproval,
    WaitingForInput,
    Completed,
    Error,
    Blocked,
    Idle,
}

impl FileStatusKind {
    pub fn to_store_status(self) -> crate::store::FileStatus {
        use crate::store::FileStatus;
        match self {
            FileStatusKind::Working => FileStatus::Working,
            FileStatusKind::WaitingForApproval => FileStatus::WaitingForApproval,
            FileStatusKind::WaitingForInput => FileStatus::WaitingForInput,
            FileStatusKind::Completed => FileStatus::Completed,
            FileStatusKind::Error => FileStatus::Error,
            FileStatusKind::Blocked => FileStatus::Blocked,
            FileStatusKind::Idle => FileStatus::Idle,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusFileFrontmatter {
    pub status: FileStatusKind,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
}

pub fn parse(raw: &str) -> Option<StatusFileFrontmatter> {
    let rest = raw.strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end = rest.find("\n---")?;
    serde_yaml::from_str(&rest[..end]).ok()
}

/// A status older than the TTL is treated as absent: the caller should
/// behave as if the file did not exist.
pub fn is_fresh(frontmatter: &StatusFileFrontmatter, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(frontmatter.updated) < Duration::milliseconds(STATUS_FILE_TTL_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_frontmatter() {
        let raw = "---\nstatus: waiting_for_approval\nupdated: 2026-01-01T00:00:00Z\n---\nbody\n";
        let fm = parse(raw).unwrap();
        assert_eq!(fm.status, FileStatusKind::WaitingForApproval);
    }

    #[test]
    fn stale_status_is_not_fresh() {
        let fm = StatusFileFrontmatter {
            status: FileStatusKind::Working,
            updated: Utc::now() - Duration::minutes(10),
            task: None,
            summary: None,
            blockers: vec![],
            next_steps: vec![],
        };
        assert!(!is_fresh(&fm, Utc::now()));
    }

    #[test]
    fn recent_status_is_fresh() {
        let fm = StatusFileFrontmatter {
            status: FileStatusKind::Working,
            updated: Utc::now() - Duration::seconds(5),
            task: None,
            summary: None,
            blockers: vec![],
            next_steps: vec![],
        };
        assert!(is_fresh(&fm, Utc::now()));
    }
}
