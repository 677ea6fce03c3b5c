//! Settings types. Every section has compiled defaults so a partial file
//! (or none at all) always yields a complete configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::loader::quill_home;

/// Root settings object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuillSettings {
    pub store: StoreSettings,
    pub narrative: NarrativeSettings,
    pub retry: RetrySettings,
    pub queue: QueueSettings,
    pub backup: BackupSettings,
    pub logging: LoggingSettings,
    /// Interface tag stored on every session row.
    pub interface: String,
}

impl Default for QuillSettings {
    fn default() -> Self {
        Self {
            store: StoreSettings::default(),
            narrative: NarrativeSettings::default(),
            retry: RetrySettings::default(),
            queue: QueueSettings::default(),
            backup: BackupSettings::default(),
            logging: LoggingSettings::default(),
            interface: "cli".to_string(),
        }
    }
}

/// Structured store location and lock behaviour.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    pub path: PathBuf,
    /// How long a writer waits on another process's lock.
    pub busy_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: quill_home().join("quill.db"),
            busy_timeout_ms: 5000,
        }
    }
}

/// Narrative (markdown transcript) settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NarrativeSettings {
    pub enabled: bool,
    pub base_dir: PathBuf,
    /// Number of most recent date directories searched when resolving a session.
    pub scan_days: usize,
}

impl Default for NarrativeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: quill_home().join("narratives"),
            scan_days: 7,
        }
    }
}

/// Retry policy applied to every sink write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub delay_ms: u64,
    /// Surface exhausted retries to the caller instead of degrading silently.
    pub strict: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 100,
            strict: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSettings {
    pub path: PathBuf,
    pub capacity: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            path: quill_home().join("failed_events.json"),
            capacity: 100,
        }
    }
}

/// Transcript backups taken before context compaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupSettings {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: quill_home().join("backups"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// Optional JSON log file. Exhausted retries are reported here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: None,
        }
    }
}

/// Settings in effect for one project after its override file is applied.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectSettings {
    /// `false` when the project has opted out of recording.
    pub enabled: bool,
    pub settings: QuillSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = QuillSettings::default();
        assert_eq!(s.retry.max_attempts, 3);
        assert!(!s.retry.strict);
        assert_eq!(s.queue.capacity, 100);
        assert_eq!(s.narrative.scan_days, 7);
        assert_eq!(s.store.busy_timeout_ms, 5000);
        assert_eq!(s.interface, "cli");
        assert!(s.store.path.ends_with("quill.db"));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: QuillSettings =
            serde_json::from_str(r#"{"retry": {"maxAttempts": 5}}"#).unwrap();
        assert_eq!(s.retry.max_attempts, 5);
        assert_eq!(s.retry.delay_ms, 100);
        assert_eq!(s.queue.capacity, 100);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(QuillSettings::default()).unwrap();
        assert!(json["store"]["busyTimeoutMs"].is_number());
        assert!(json["narrative"]["scanDays"].is_number());
        assert!(json["logging"].get("file").is_none());
    }
}
