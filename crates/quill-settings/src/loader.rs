//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`QuillSettings::default()`]
//! 2. If `~/.quill/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `QUILL_*` environment variable overrides (highest priority)
//!
//! A project may carry a `.quill.json` file at its root. It is merged over
//! the global settings by [`load_project_settings`] and is never written here.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{ProjectSettings, QuillSettings};

/// File name of the per-project override, relative to the project root.
pub const PROJECT_OVERRIDE_FILE: &str = ".quill.json";

/// Root directory for quill's default paths (`$QUILL_HOME` or `~/.quill`).
pub fn quill_home() -> PathBuf {
    if let Some(home) = read_env_string("QUILL_HOME") {
        return PathBuf::from(home);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".quill")
}

/// Resolve the path to the global settings file.
pub fn settings_path() -> PathBuf {
    quill_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<QuillSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<QuillSettings> {
    let defaults = serde_json::to_value(QuillSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: QuillSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Compute the effective settings for a project.
///
/// A missing override file means "enabled, global settings". A malformed
/// one is ignored with a warning rather than blocking the event.
pub fn load_project_settings(global: &QuillSettings, project_dir: &Path) -> ProjectSettings {
    let path = project_dir.join(PROJECT_OVERRIDE_FILE);
    let fallback = || ProjectSettings {
        enabled: true,
        settings: global.clone(),
    };

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(_) => return fallback(),
    };

    match merge_project_override(global, &content) {
        Ok(project) => {
            debug!(?path, enabled = project.enabled, "applied project override");
            project
        }
        Err(e) => {
            warn!(?path, error = %e, "invalid project override, using global settings");
            fallback()
        }
    }
}

/// Merge the raw contents of a project override file over `global`.
pub fn merge_project_override(global: &QuillSettings, content: &str) -> Result<ProjectSettings> {
    let mut overrides: Value = serde_json::from_str(content)?;
    let enabled = overrides
        .as_object_mut()
        .and_then(|map| map.remove("enabled"))
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let base = serde_json::to_value(global)?;
    let settings: QuillSettings = serde_json::from_value(deep_merge(base, overrides))?;
    Ok(ProjectSettings { enabled, settings })
}

/// Merge `source` over `target` and return the result.
///
/// Objects merge key by key; anything else in `source` replaces the
/// target value. `null` in `source` leaves the target untouched.
pub fn deep_merge(mut target: Value, source: Value) -> Value {
    merge_into(&mut target, source);
    target
}

fn merge_into(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, value) in source_map.into_iter().filter(|(_, v)| !v.is_null()) {
                match target_map.get_mut(&key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        let _ = target_map.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (target, source) => *target = source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides(settings: &mut QuillSettings) {
    if let Some(v) = read_env_string("QUILL_DB") {
        settings.store.path = PathBuf::from(v);
    }
    if let Some(v) = read_env_string("QUILL_NARRATIVE_DIR") {
        settings.narrative.base_dir = PathBuf::from(v);
    }
    if let Some(v) = read_env_string("QUILL_QUEUE_PATH") {
        settings.queue.path = PathBuf::from(v);
    }
    if let Some(v) = read_env_u64("QUILL_MAX_ATTEMPTS", 1, 100) {
        settings.retry.max_attempts = v as u32;
    }
    if let Some(v) = read_env_u64("QUILL_RETRY_DELAY_MS", 0, 60_000) {
        settings.retry.delay_ms = v;
    }
    if let Some(v) = read_env_bool("QUILL_STRICT") {
        settings.retry.strict = v;
    }
    if let Some(v) = read_env_string("QUILL_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    let val = val.trim().to_ascii_lowercase();
    if ["true", "1", "yes", "on"].contains(&val.as_str()) {
        Some(true)
    } else if ["false", "0", "no", "off"].contains(&val.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// An integer in `min..=max`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    val.trim()
        .parse::<u64>()
        .ok()
        .filter(|n| (min..=max).contains(n))
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Read and parse an env var, warning when it is set but invalid.
fn read_env<T>(name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    let raw = read_env_string(name)?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        warn!(key = name, value = %raw, "ignoring invalid environment override");
    }
    parsed
}

fn read_env_bool(name: &str) -> Option<bool> {
    read_env(name, parse_bool)
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    read_env(name, |v| parse_u64_range(v, min, max))
}
