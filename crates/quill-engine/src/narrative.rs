//! Append-only markdown transcript, one file per session.
//!
//! A new file gets a header; re-engaging an existing file appends a resume
//! marker instead. Blocks are appended one write at a time and never
//! rewritten. The only in-place edit is the header status line on finalize.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Local, Utc};
use regex::Regex;
use tracing::{debug, warn};

use quill_core::{SessionId, SessionStatus};

use crate::error::NarrativeError;
use crate::resolver::{NarrativePointers, SessionResolver};
use crate::tools::ToolInput;

static HEADER_STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^- \*\*Status:\*\* [A-Za-z]+$").unwrap());

/// The session an operation applies to.
#[derive(Clone, Copy, Debug)]
pub struct SessionRef<'a> {
    pub id: &'a SessionId,
    pub project: &'a str,
    /// When the triggering event was received.
    pub at: DateTime<Utc>,
}

/// Event-specific content appended to a narrative.
#[derive(Clone, Debug)]
pub enum NarrativeBlock<'a> {
    User {
        prompt: &'a str,
    },
    Assistant {
        text: &'a str,
    },
    ToolCall(ToolInput),
    ToolResult {
        tool_name: &'a str,
        success: bool,
    },
    Notification {
        message: &'a str,
    },
    Compaction {
        trigger: &'a str,
        instructions: Option<&'a str>,
        backup_path: Option<&'a str>,
    },
    SubagentStop,
    Generic {
        event_type: &'a str,
    },
}

impl NarrativeBlock<'_> {
    pub fn render(&self, at: &DateTime<Utc>) -> String {
        let time = clock(at);
        match self {
            Self::User { prompt } => format!("## User ({time})\n\n{}\n\n", prompt.trim_end()),
            Self::Assistant { text } => {
                format!("## Assistant ({time})\n\n{}\n\n", text.trim_end())
            }
            Self::ToolCall(input) => input.narrative_block(&time),
            Self::ToolResult { tool_name, success } => {
                let outcome = if *success { "Success" } else { "Failed" };
                format!("**{tool_name} result:** {outcome}\n\n")
            }
            Self::Notification { message } => {
                format!("> **Notification ({time}):** {}\n\n", message.trim())
            }
            Self::Compaction {
                trigger,
                instructions,
                backup_path,
            } => {
                let mut out = format!("## Context Compaction ({time})\n\n- **Trigger:** {trigger}\n");
                if let Some(instructions) = instructions.filter(|s| !s.trim().is_empty()) {
                    out.push_str(&format!("- **Instructions:** {}\n", instructions.trim()));
                }
                if let Some(path) = backup_path {
                    out.push_str(&format!("- **Transcript backup:** `{path}`\n"));
                }
                out.push('\n');
                out
            }
            Self::SubagentStop => format!("### Subagent finished ({time})\n\n"),
            Self::Generic { event_type } => format!("### Event: {event_type} ({time})\n\n"),
        }
    }
}

pub struct NarrativeLog {
    resolver: SessionResolver,
}

impl NarrativeLog {
    pub fn new(resolver: SessionResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &SessionResolver {
        &self.resolver
    }

    /// Open the session's narrative: a header for a new file, a resume
    /// marker for one that already has content.
    pub fn init(
        &self,
        pointers: Option<&dyn NarrativePointers>,
        session: SessionRef<'_>,
        source: Option<&str>,
        first_in_project: Option<bool>,
    ) -> Result<PathBuf, NarrativeError> {
        let target = self
            .resolver
            .resolve(pointers, session.id, session.project, &session.at)?;
        if target.is_new() || is_empty_file(&target.path) {
            append_text(&target.path, &header(session, source, first_in_project))?;
        } else {
            debug!(session_id = %session.id, path = %target.path.display(), "resuming narrative");
            append_text(&target.path, &resume_marker(&session.at, source))?;
        }
        Ok(target.path)
    }

    /// Append one block. A session seen for the first time mid-stream gets
    /// a header first.
    pub fn append(
        &self,
        pointers: Option<&dyn NarrativePointers>,
        session: SessionRef<'_>,
        block: &NarrativeBlock<'_>,
    ) -> Result<PathBuf, NarrativeError> {
        let target = self
            .resolver
            .resolve(pointers, session.id, session.project, &session.at)?;
        if target.is_new() || is_empty_file(&target.path) {
            append_text(&target.path, &header(session, None, None))?;
        }
        append_text(&target.path, &block.render(&session.at))?;
        Ok(target.path)
    }

    /// Stamp the final status into the header and append an end marker.
    ///
    /// Returns `Ok(None)` when no narrative could be located for the session.
    pub fn finalize(
        &self,
        pointers: Option<&dyn NarrativePointers>,
        session: SessionRef<'_>,
        status: SessionStatus,
        reason: Option<&str>,
    ) -> Result<Option<PathBuf>, NarrativeError> {
        let Some(target) = self.resolver.locate(pointers, session.id, session.project) else {
            warn!(session_id = %session.id, "no narrative log found to finalize");
            return Ok(None);
        };
        let path = target.path;

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(session_id = %session.id, path = %path.display(), "narrative log vanished");
                return Ok(None);
            }
            Err(e) => return Err(NarrativeError::io(&path, e)),
        };
        let status_line = format!("- **Status:** {}", status.label());
        let updated = HEADER_STATUS.replace(&content, status_line.as_str());
        if updated != content {
            fs::write(&path, updated.as_bytes()).map_err(|e| NarrativeError::io(&path, e))?;
        }

        append_text(&path, &end_marker(&session.at, status, reason))?;
        Ok(Some(path))
    }
}

fn header(session: SessionRef<'_>, source: Option<&str>, first_in_project: Option<bool>) -> String {
    let mut out = format!(
        "# Session {short}\n\n\
         - **Session ID:** {id}\n\
         - **Project:** {project}\n\
         - **Started:** {started}\n",
        short = session.id.short(),
        id = session.id,
        project = session.project,
        started = local_datetime(&session.at),
    );
    if let Some(source) = source {
        out.push_str(&format!("- **Source:** {source}\n"));
    }
    match first_in_project {
        Some(true) => out.push_str("- **Project history:** First recorded session\n"),
        Some(false) => out.push_str("- **Project history:** Returning project\n"),
        None => {}
    }
    out.push_str(&format!("- **Status:** {}\n\n---\n\n", SessionStatus::Active.label()));
    out
}

fn resume_marker(at: &DateTime<Utc>, source: Option<&str>) -> String {
    let mut out = format!("---\n\n## Session Resumed ({})\n\n", local_datetime(at));
    if let Some(source) = source {
        out.push_str(&format!("- **Source:** {source}\n\n"));
    }
    out
}

fn end_marker(at: &DateTime<Utc>, status: SessionStatus, reason: Option<&str>) -> String {
    let mut out = format!(
        "---\n\n## Session Ended ({})\n\n- **Final status:** {}\n",
        local_datetime(at),
        status.label()
    );
    if let Some(reason) = reason {
        out.push_str(&format!("- **Reason:** {reason}\n"));
    }
    out.push('\n');
    out
}

fn append_text(path: &Path, text: &str) -> Result<(), NarrativeError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| NarrativeError::io(path, e))?;
    file.write_all(text.as_bytes())
        .map_err(|e| NarrativeError::io(path, e))
}

fn is_empty_file(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() == 0).unwrap_or(false)
}

fn local_datetime(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn clock(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M:%S").to_string()
}
