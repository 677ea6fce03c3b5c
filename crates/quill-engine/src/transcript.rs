//! Access to the agent's own JSONL transcript.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde_json::Value;
use tracing::debug;

use quill_core::SessionId;

/// Text of the last assistant turn in a JSONL transcript.
///
/// Lines that are not JSON, and assistant turns with no text blocks, are
/// skipped. Returns `None` when the file is unreadable or has no such turn.
pub fn last_assistant_text(path: &Path) -> Option<String> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "transcript unreadable");
            return None;
        }
    };
    content
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .filter(|entry| entry.get("type").and_then(Value::as_str) == Some("assistant"))
        .find_map(|entry| assistant_text(&entry))
}

fn assistant_text(entry: &Value) -> Option<String> {
    let content = entry.get("message")?.get("content")?;
    let text = match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n\n"),
        _ => return None,
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Copy a transcript to `{backup_dir}/{YYYY-MM-DD}/{HHMMSS}_{prefix}_{trigger}.jsonl`.
pub fn backup_transcript(
    source: &Path,
    backup_dir: &Path,
    session_id: &SessionId,
    trigger: &str,
    at: &DateTime<Utc>,
) -> std::io::Result<PathBuf> {
    let local = at.with_timezone(&Local);
    let dir = backup_dir.join(local.format("%Y-%m-%d").to_string());
    fs::create_dir_all(&dir)?;

    let trigger: String = trigger
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let name = format!(
        "{}_{}_{}.jsonl",
        local.format("%H%M%S"),
        session_id.short(),
        if trigger.is_empty() { "unknown" } else { trigger.as_str() }
    );
    let dest = dir.join(name);
    let _ = fs::copy(source, &dest)?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSCRIPT: &str = r#"{"type":"user","message":{"role":"user","content":"hi"}}
{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"First answer"}]}}
not json at all
{"type":"user","message":{"role":"user","content":"again"}}
{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Second"},{"type":"tool_use","name":"Bash"},{"type":"text","text":"answer"}]}}
{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","name":"Read"}]}}
"#;

    #[test]
    fn finds_last_assistant_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        fs::write(&path, TRANSCRIPT).unwrap();
        assert_eq!(last_assistant_text(&path).as_deref(), Some("Second\n\nanswer"));
    }

    #[test]
    fn string_content_supported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        fs::write(
            &path,
            r#"{"type":"assistant","message":{"content":"  plain  "}}"#,
        )
        .unwrap();
        assert_eq!(last_assistant_text(&path).as_deref(), Some("plain"));
    }

    #[test]
    fn missing_transcript_is_none() {
        assert!(last_assistant_text(Path::new("/nonexistent/t.jsonl")).is_none());
    }

    #[test]
    fn backup_copies_into_dated_dir() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("t.jsonl");
        fs::write(&source, TRANSCRIPT).unwrap();
        let at = Utc::now();

        let dest = backup_transcript(
            &source,
            &dir.path().join("backups"),
            &SessionId::from_raw("abc12345-0000"),
            "auto",
            &at,
        )
        .unwrap();

        let local = at.with_timezone(&Local);
        assert_eq!(
            dest,
            dir.path()
                .join("backups")
                .join(local.format("%Y-%m-%d").to_string())
                .join(format!("{}_abc12345_auto.jsonl", local.format("%H%M%S")))
        );
        assert_eq!(fs::read_to_string(dest).unwrap(), TRANSCRIPT);
    }

    #[test]
    fn backup_of_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = backup_transcript(
            &dir.path().join("missing.jsonl"),
            dir.path(),
            &SessionId::from_raw("abc"),
            "manual",
            &Utc::now(),
        );
        assert!(result.is_err());
    }
}
