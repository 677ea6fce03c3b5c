use serde::Serialize;

use crate::engine::ProcessOutcome;

/// JSON object written to stdout after a hook is processed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookReply {
    #[serde(rename = "continue")]
    pub continue_: bool,
    pub suppress_output: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
}

impl HookReply {
    pub fn ok() -> Self {
        Self {
            continue_: true,
            suppress_output: true,
            system_message: None,
        }
    }

    /// Reply for a processed event. Failures are only reported to the
    /// caller in strict mode.
    pub fn from_outcome(outcome: &ProcessOutcome) -> Self {
        if !outcome.strict_failure() {
            return Self::ok();
        }
        let failed: Vec<String> = outcome
            .failures()
            .map(|(sink, error)| format!("{sink}: {error}"))
            .collect();
        Self {
            continue_: true,
            suppress_output: false,
            system_message: Some(format!("quill could not persist event ({})", failed.join("; "))),
        }
    }
}

impl Default for HookReply {
    fn default() -> Self {
        Self::ok()
    }
}
