//! Tool call payloads as a closed set of variants.
//!
//! Each known tool is parsed into its own variant and formatted on its own.
//! Tools this build does not recognise keep their raw input in [`ToolInput::Other`].

use serde_json::Value;

/// Maximum length of a stored input summary.
pub const SUMMARY_MAX_CHARS: usize = 200;

#[derive(Clone, Debug, PartialEq)]
pub enum ToolInput {
    Bash {
        command: String,
        description: Option<String>,
    },
    Read {
        file_path: String,
    },
    Write {
        file_path: String,
        bytes: usize,
    },
    Edit {
        file_path: String,
    },
    MultiEdit {
        file_path: String,
        edits: usize,
    },
    Grep {
        pattern: String,
        path: Option<String>,
    },
    Glob {
        pattern: String,
    },
    WebFetch {
        url: String,
    },
    WebSearch {
        query: String,
    },
    Task {
        description: String,
        subagent_type: Option<String>,
    },
    TodoWrite {
        items: usize,
    },
    Other {
        name: String,
        input: Value,
    },
}

impl ToolInput {
    pub fn parse(name: &str, input: Option<&Value>) -> Self {
        let null = Value::Null;
        let input = input.unwrap_or(&null);
        match name {
            "Bash" => Self::Bash {
                command: str_field(input, "command"),
                description: opt_str_field(input, "description"),
            },
            "Read" => Self::Read {
                file_path: str_field(input, "file_path"),
            },
            "Write" => Self::Write {
                file_path: str_field(input, "file_path"),
                bytes: input
                    .get("content")
                    .and_then(Value::as_str)
                    .map_or(0, str::len),
            },
            "Edit" => Self::Edit {
                file_path: str_field(input, "file_path"),
            },
            "MultiEdit" => Self::MultiEdit {
                file_path: str_field(input, "file_path"),
                edits: array_len(input, "edits"),
            },
            "Grep" => Self::Grep {
                pattern: str_field(input, "pattern"),
                path: opt_str_field(input, "path"),
            },
            "Glob" => Self::Glob {
                pattern: str_field(input, "pattern"),
            },
            "WebFetch" => Self::WebFetch {
                url: str_field(input, "url"),
            },
            "WebSearch" => Self::WebSearch {
                query: str_field(input, "query"),
            },
            "Task" => Self::Task {
                description: str_field(input, "description"),
                subagent_type: opt_str_field(input, "subagent_type"),
            },
            "TodoWrite" => Self::TodoWrite {
                items: array_len(input, "todos"),
            },
            other => Self::Other {
                name: other.to_string(),
                input: input.clone(),
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Bash { .. } => "Bash",
            Self::Read { .. } => "Read",
            Self::Write { .. } => "Write",
            Self::Edit { .. } => "Edit",
            Self::MultiEdit { .. } => "MultiEdit",
            Self::Grep { .. } => "Grep",
            Self::Glob { .. } => "Glob",
            Self::WebFetch { .. } => "WebFetch",
            Self::WebSearch { .. } => "WebSearch",
            Self::Task { .. } => "Task",
            Self::TodoWrite { .. } => "TodoWrite",
            Self::Other { name, .. } => name,
        }
    }

    /// One-line description stored alongside the invocation row.
    pub fn summary(&self) -> String {
        let full = match self {
            Self::Bash { command, .. } => command.clone(),
            Self::Read { file_path } | Self::Edit { file_path } => file_path.clone(),
            Self::Write { file_path, bytes } => format!("{file_path} ({bytes} bytes)"),
            Self::MultiEdit { file_path, edits } => format!("{file_path} ({edits} edits)"),
            Self::Grep { pattern, path } => match path {
                Some(path) => format!("{pattern} in {path}"),
                None => pattern.clone(),
            },
            Self::Glob { pattern } => pattern.clone(),
            Self::WebFetch { url } => url.clone(),
            Self::WebSearch { query } => query.clone(),
            Self::Task { description, .. } => description.clone(),
            Self::TodoWrite { items } => format!("{items} items"),
            Self::Other { input, .. } => match input {
                Value::Null => String::new(),
                other => other.to_string(),
            },
        };
        truncate_chars(&full, SUMMARY_MAX_CHARS)
    }

    /// Markdown block appended to the narrative log when the call starts.
    pub fn narrative_block(&self, time: &str) -> String {
        let heading = format!("### Tool: {} ({time})\n\n", self.name());
        let body = match self {
            Self::Bash {
                command,
                description,
            } => {
                let mut body = String::new();
                if let Some(description) = description {
                    body.push_str(&format!("{description}\n\n"));
                }
                body.push_str(&format!("```bash\n{command}\n```\n"));
                body
            }
            Self::Read { file_path } => format!("Reading `{file_path}`\n"),
            Self::Write { file_path, bytes } => {
                format!("Writing `{file_path}` ({bytes} bytes)\n")
            }
            Self::Edit { file_path } => format!("Editing `{file_path}`\n"),
            Self::MultiEdit { file_path, edits } => {
                format!("Editing `{file_path}` ({edits} edits)\n")
            }
            Self::Grep { pattern, path } => match path {
                Some(path) => format!("Searching for `{pattern}` in `{path}`\n"),
                None => format!("Searching for `{pattern}`\n"),
            },
            Self::Glob { pattern } => format!("Finding files matching `{pattern}`\n"),
            Self::WebFetch { url } => format!("Fetching <{url}>\n"),
            Self::WebSearch { query } => format!("Searching the web for \"{query}\"\n"),
            Self::Task {
                description,
                subagent_type,
            } => match subagent_type {
                Some(agent) => format!("Delegating to `{agent}`: {description}\n"),
                None => format!("Delegating: {description}\n"),
            },
            Self::TodoWrite { items } => format!("Updating todo list ({items} items)\n"),
            Self::Other { .. } => {
                let summary = self.summary();
                if summary.is_empty() {
                    String::new()
                } else {
                    format!("```json\n{summary}\n```\n")
                }
            }
        };
        format!("{heading}{body}\n")
    }
}

/// Whether a tool response reports success.
///
/// Absent responses count as success; the agent only omits them for tools
/// that produce no output.
pub fn tool_succeeded(response: Option<&Value>) -> bool {
    let Some(response) = response.and_then(Value::as_object) else {
        return true;
    };
    if response.get("success").and_then(Value::as_bool) == Some(false) {
        return false;
    }
    if response.get("is_error").and_then(Value::as_bool) == Some(true) {
        return false;
    }
    if response.get("interrupted").and_then(Value::as_bool) == Some(true) {
        return false;
    }
    match response.get("error") {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Bool(b)) => !b,
        Some(_) => false,
    }
}

fn str_field(input: &Value, key: &str) -> String {
    opt_str_field(input, key).unwrap_or_default()
}

fn opt_str_field(input: &Value, key: &str) -> Option<String> {
    input
        .get(key)
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn array_len(input: &Value, key: &str) -> usize {
    input.get(key).and_then(Value::as_array).map_or(0, Vec::len)
}

/// Truncate on a char boundary, marking the cut with an ellipsis.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
