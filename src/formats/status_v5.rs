// Briefing file format (`status.v5`): YAML frontmatter + markdown body,
// delimited by the standard `--- ... ---` block.
//
// Parse failures yield `None`, never an error the watcher has to handle —
// matching the transcript parser's "malformed unit, drop it" policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BriefingStatus {
    Working,
    WaitingForApproval,
    WaitingForInput,
    Completed,
    Error,
    Blocked,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    Trivial,
    Minor,
    Moderate,
    Major,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastLevel {
    Silent,
    Mention,
    Highlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocDriftRisk {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusV5Frontmatter {
    pub schema: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub repo_name: Option<String>,
    #[serde(default)]
    pub repo_root: Option<String>,
    #[serde(default)]
    pub git_remote: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    pub status: BriefingStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub impact_level: ImpactLevel,
    pub broadcast_level: BroadcastLevel,
    pub doc_drift_risk: DocDriftRisk,
    #[serde(default)]
    pub base_commit: Option<String>,
    #[serde(default)]
    pub head_commit: Option<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub docs_touched: Vec<String>,
    #[serde(default)]
    pub files_touched: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StatusV5Document {
    pub frontmatter: StatusV5Frontmatter,
    pub body: String,
}

/// Split `--- \n <yaml> \n --- \n <body>` and parse the frontmatter. Both
/// inline-array (`blockers: [a, b]`) and block-list forms are accepted
/// because that's just YAML; nothing special is needed to support both.
pub fn parse(raw: &str) -> Option<StatusV5Document> {
    let rest = raw.strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end = rest.find("\n---")?;
    let yaml = &rest[..end];
    let after_marker = &rest[end + 4..];
    let body = after_marker.strip_prefix('\n').unwrap_or(after_marker);

    let frontmatter: StatusV5Frontmatter = serde_yaml::from_str(yaml).ok()?;
    if frontmatter.schema != "status.v5" {
        return None;
    }

    Some(StatusV5Document {
        frontmatter,
        body: body.to_string(),
    })
}

pub fn generate(doc: &StatusV5Document) -> String {
    let yaml = serde_yaml::to_string(&doc.frontmatter).unwrap_or_default();
    format!("---\n{}---\n{}", yaml, doc.body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StatusV5Document {
        StatusV5Document {
            frontmatter: StatusV5Frontmatter {
                schema: "status.v5".to_string(),
                project_id: Some("proj-1".to_string()),
                repo_name: Some("mimesis".to_string()),
                repo_root: None,
                git_remote: None,
                branch: Some("main".to_string()),
                session_id: Some("sess-1".to_string()),
                task_id: None,
                status: BriefingStatus::Completed,
                started_at: Some(Utc::now()),
                ended_at: Some(Utc::now()),
                impact_level: ImpactLevel::Moderate,
                broadcast_level: BroadcastLevel::Mention,
                doc_drift_risk: DocDriftRisk::Low,
                base_commit: Some("abc123".to_string()),
                head_commit: Some("def456".to_string()),
                blockers: vec![],
                next_steps: vec!["ship it".to_string()],
                docs_touched: vec![],
                files_touched: vec!["src/lib.rs".to_string()],
            },
            body: "## Summary\nDid the thing.\n".to_string(),
        }
    }

    #[test]
    fn round_trips_through_generate_and_parse() {
        let doc = sample();
        let raw = generate(&doc);
        let parsed = parse(&raw).unwrap();
        assert_eq!(parsed.frontmatter.project_id, doc.frontmatter.project_id);
        assert_eq!(parsed.frontmatter.status, doc.frontmatter.status);
        assert_eq!(parsed.body, doc.body);
    }

    #[test]
    fn accepts_inline_array_form() {
        let raw = "---\nschema: status.v5\nstatus: completed\nimpact_level: minor\nbroadcast_level: silent\ndoc_drift_risk: low\nblockers: [a, b]\n---\nbody\n";
        let doc = parse(raw).unwrap();
        assert_eq!(doc.frontmatter.blockers, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn wrong_schema_tag_is_rejected() {
        let raw = "---\nschema: status.v4\nstatus: completed\nimpact_level: minor\nbroadcast_level: silent\ndoc_drift_risk: low\n---\nbody\n";
        assert!(parse(raw).is_none());
    }

    #[test]
    fn malformed_yaml_yields_none_not_a_panic() {
        let raw = "---\nschema: [unterminated\n---\nbody\n";
        assert!(parse(raw).is_none());
    }

    #[test]
    fn missing_delimiter_yields_none() {
        assert!(parse("not frontmatter at all").is_none());
    }
}
