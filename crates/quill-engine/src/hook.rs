use serde::{Deserialize, Serialize};
use serde_json::Value;

use quill_core::{PersistError, SessionId, SessionStatus};

/// Project identifier used when the payload carries no working directory.
pub const UNKNOWN_PROJECT: &str = "unknown";

/// Lifecycle event kinds emitted by the agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookKind {
    SessionStart,
    SessionEnd,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    Notification,
    PreCompact,
    Stop,
    SubagentStop,
    /// Anything this build does not know; recorded as a generic event.
    Other(String),
}

impl HookKind {
    pub fn parse(name: &str) -> Self {
        match name {
            "SessionStart" => Self::SessionStart,
            "SessionEnd" => Self::SessionEnd,
            "UserPromptSubmit" => Self::UserPromptSubmit,
            "PreToolUse" => Self::PreToolUse,
            "PostToolUse" => Self::PostToolUse,
            "Notification" => Self::Notification,
            "PreCompact" => Self::PreCompact,
            "Stop" => Self::Stop,
            "SubagentStop" => Self::SubagentStop,
            other => Self::Other(other.to_string()),
        }
    }

    /// Snake-case name stored as the generic event type.
    pub fn event_type(&self) -> String {
        match self {
            Self::SessionStart => "session_start".into(),
            Self::SessionEnd => "session_end".into(),
            Self::UserPromptSubmit => "user_prompt_submit".into(),
            Self::PreToolUse => "pre_tool_use".into(),
            Self::PostToolUse => "post_tool_use".into(),
            Self::Notification => "notification".into(),
            Self::PreCompact => "pre_compact".into(),
            Self::Stop => "stop".into(),
            Self::SubagentStop => "subagent_stop".into(),
            Self::Other(name) => to_snake_case(name),
        }
    }
}

/// One hook payload as delivered on stdin.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HookInput {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub hook_event_name: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<String>,
    /// SessionStart origin: startup, resume, clear, compact.
    #[serde(default)]
    pub source: Option<String>,
    /// SessionEnd reason.
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<Value>,
    #[serde(default)]
    pub tool_response: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
    /// PreCompact trigger: manual or auto.
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub stop_hook_active: Option<bool>,
}

impl HookInput {
    /// Parse raw stdin text into a payload value.
    pub fn parse_raw(raw: &str) -> Result<Value, PersistError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PersistError::MalformedInput("empty input".into()));
        }
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| PersistError::MalformedInput(e.to_string()))?;
        if !value.is_object() {
            return Err(PersistError::MalformedInput("payload is not a JSON object".into()));
        }
        Ok(value)
    }

    pub fn from_value(value: &Value) -> Result<Self, PersistError> {
        let input: Self = serde_json::from_value(value.clone())
            .map_err(|e| PersistError::MalformedInput(e.to_string()))?;
        if input.session_id.trim().is_empty() {
            return Err(PersistError::MalformedInput("missing session_id".into()));
        }
        Ok(input)
    }

    pub fn kind(&self) -> HookKind {
        HookKind::parse(&self.hook_event_name)
    }

    pub fn session_id(&self) -> SessionId {
        SessionId::from_raw(self.session_id.trim())
    }

    /// Project identifier: the working directory, or [`UNKNOWN_PROJECT`].
    pub fn project(&self) -> String {
        self.cwd
            .as_deref()
            .map(str::trim)
            .filter(|cwd| !cwd.is_empty())
            .unwrap_or(UNKNOWN_PROJECT)
            .to_string()
    }

    pub fn tool_name(&self) -> &str {
        self.tool_name.as_deref().unwrap_or("unknown")
    }
}

/// Terminal status implied by a SessionEnd reason.
pub fn status_for_end_reason(reason: Option<&str>) -> SessionStatus {
    match reason {
        Some("interrupted" | "error") => SessionStatus::Interrupted,
        _ => SessionStatus::Completed,
    }
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else if c.is_ascii_alphanumeric() {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        "unknown".to_string()
    } else {
        out
    }
}
