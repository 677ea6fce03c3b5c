//! # quill-settings
//!
//! Configuration for quill, loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`QuillSettings::default()`]
//! 2. **User file**: `~/.quill/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `QUILL_*` overrides (highest priority)
//!
//! Per-project `.quill.json` files are layered on top by
//! [`load_project_settings`].

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    deep_merge, load_project_settings, load_settings, load_settings_from_path,
    merge_project_override, quill_home, settings_path, PROJECT_OVERRIDE_FILE,
};
pub use types::*;
