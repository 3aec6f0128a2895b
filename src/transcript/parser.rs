// Transcript Parser (component A): incremental tailing of one JSONL file by
// byte offset. Grounded on the Claude Code session JSONL tailer's
// `read_new_entries`: blocking I/O on a dedicated thread, `BufRead::lines()`,
// byte offset tracked as the sum of consumed line lengths (+1 per newline),
// so a partial trailing line is simply never counted into the new offset.

use crate::transcript::entry::LogEntry;
use std::io::{self, BufRead, Seek, SeekFrom};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ExtractedMetadata {
    pub session_id: String,
    pub cwd: Option<String>,
    pub git_branch: Option<String>,
    pub original_prompt: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Read `filepath` from `from_byte` to EOF, splitting on newlines. Lines that
/// fail to parse as a `LogEntry` are dropped silently; a partial trailing
/// line (no terminating `\n` yet) is never consumed and will be re-read on
/// the next call. Returns the parsed entries and the new byte offset.
pub async fn tail(filepath: &Path, from_byte: u64) -> io::Result<(Vec<LogEntry>, u64)> {
    let path = filepath.to_path_buf();
    tokio::task::spawn_blocking(move || tail_blocking(&path, from_byte))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

fn tail_blocking(path: &Path, from_byte: u64) -> io::Result<(Vec<LogEntry>, u64)> {
    let mut file = std::fs::File::open(path)?;
    let file_len = file.metadata()?.len();

    if file_len < from_byte {
        // Truncated/rotated underneath us; restart from the top.
        return tail_blocking(path, 0);
    }
    if file_len == from_byte {
        return Ok((Vec::new(), from_byte));
    }

    file.seek(SeekFrom::Start(from_byte))?;
    let reader = io::BufReader::new(&file);

    let mut entries = Vec::new();
    let mut consumed: u64 = 0;
    for line_result in reader.lines() {
        let line = match line_result {
            Ok(l) => l,
            // A genuine I/O error (not just a missing trailing newline,
            // which `lines()` still yields as Ok) stops the batch here;
            // bytes already consumed are still reported.
            Err(_) => break,
        };
        consumed += line.len() as u64 + 1;
        if let Some(entry) = LogEntry::from_line(&line) {
            entries.push(entry);
        }
    }

    Ok((entries, from_byte + consumed))
}

/// basename minus the `.jsonl` extension.
pub fn extract_session_id(filepath: &Path) -> Option<String> {
    filepath
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
}

/// Uses the first user entry whose content is a non-empty string to
/// populate `original_prompt`, and the first entry carrying identity fields
/// for everything else. Per the source-inconsistency note in the design
/// notes, this metadata MUST be captured once and persisted — it is not
/// re-derived from a possibly-trimmed entry list later.
pub fn extract_metadata(entries: &[LogEntry]) -> Option<ExtractedMetadata> {
    use crate::transcript::entry::{EntryBody, UserContent};

    let first = entries.first()?;
    let original_prompt = entries.iter().find_map(|e| match &e.body {
        EntryBody::User(UserContent::Text(text)) if !text.trim().is_empty() => {
            Some(text.clone())
        }
        _ => None,
    });

    Some(ExtractedMetadata {
        session_id: first.session_id.clone(),
        cwd: first.cwd.clone(),
        git_branch: first.git_branch.clone(),
        original_prompt,
        started_at: first.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    fn write_line(file: &mut NamedTempFile, json: &str) {
        writeln!(file, "{}", json).unwrap();
        file.flush().unwrap();
    }

    #[tokio::test]
    async fn incremental_tail_returns_exactly_the_new_entry() {
        let mut file = NamedTempFile::new().unwrap();
        write_line(
            &mut file,
            r#"{"type":"user","uuid":"u1","timestamp":"2026-01-01T00:00:00Z","sessionId":"s1","message":{"content":"A"}}"#,
        );

        let (entries, p1) = tail(file.path(), 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(p1 > 0);

        write_line(
            &mut file,
            r#"{"type":"user","uuid":"u2","timestamp":"2026-01-01T00:00:01Z","sessionId":"s1","message":{"content":"B"}}"#,
        );

        let (entries2, p2) = tail(file.path(), p1).await.unwrap();
        assert_eq!(entries2.len(), 1);
        assert_eq!(entries2[0].uuid, "u2");
        assert!(p2 > p1);
    }

    #[tokio::test]
    async fn tail_is_idempotent_on_a_closed_file() {
        let mut file = NamedTempFile::new().unwrap();
        write_line(
            &mut file,
            r#"{"type":"user","uuid":"u1","timestamp":"2026-01-01T00:00:00Z","sessionId":"s1","message":{"content":"A"}}"#,
        );
        let (_entries, pos) = tail(file.path(), 0).await.unwrap();
        let (entries_again, pos_again) = tail(file.path(), pos).await.unwrap();
        assert!(entries_again.is_empty());
        assert_eq!(pos, pos_again);
    }

    #[tokio::test]
    async fn malformed_lines_are_dropped_not_fatal() {
        let mut file = NamedTempFile::new().unwrap();
        write_line(&mut file, "{not json}");
        write_line(
            &mut file,
            r#"{"type":"user","uuid":"u1","timestamp":"2026-01-01T00:00:00Z","sessionId":"s1","message":{"content":"A"}}"#,
        );
        let (entries, _pos) = tail(file.path(), 0).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn extract_session_id_strips_jsonl_extension() {
        let path = PathBuf::from("/tmp/.claude/projects/x/abc-123.jsonl");
        assert_eq!(extract_session_id(&path), Some("abc-123".to_string()));
    }

    #[tokio::test]
    async fn extract_metadata_finds_first_nonempty_user_prompt() {
        let mut file = NamedTempFile::new().unwrap();
        write_line(
            &mut file,
            r#"{"type":"system","uuid":"sy1","timestamp":"2026-01-01T00:00:00Z","sessionId":"s1","cwd":"/repo","gitBranch":"main","subtype":"init"}"#,
        );
        write_line(
            &mut file,
            r#"{"type":"user","uuid":"u1","timestamp":"2026-01-01T00:00:01Z","sessionId":"s1","message":{"content":"do the thing"}}"#,
        );
        let (entries, _pos) = tail(file.path(), 0).await.unwrap();
        let meta = extract_metadata(&entries).unwrap();
        assert_eq!(meta.session_id, "s1");
        assert_eq!(meta.cwd.as_deref(), Some("/repo"));
        assert_eq!(meta.original_prompt.as_deref(), Some("do the thing"));
    }
}
