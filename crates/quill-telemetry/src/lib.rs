use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "quill_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON log file used as the side channel for degraded failures.
    pub log_file: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::WARN,
            module_levels: Vec::new(),
            log_file: None,
        }
    }
}

impl TelemetryConfig {
    /// Build a config from a level name such as "warn" or "debug".
    /// Unknown names fall back to WARN.
    pub fn from_level_name(level: &str, log_file: Option<PathBuf>) -> Self {
        Self {
            log_level: parse_level(level).unwrap_or(Level::WARN),
            module_levels: Vec::new(),
            log_file,
        }
    }
}

/// Handle returned by [`init_telemetry`].
pub struct TelemetryGuard {
    log_file: Option<PathBuf>,
    installed: bool,
}

impl TelemetryGuard {
    /// Path of the JSON log file, when one was opened.
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    /// False when a global subscriber was already installed.
    pub fn installed(&self) -> bool {
        self.installed
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
///
/// Human-readable output goes to stderr; stdout belongs to the hook reply.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let directive = filter_directive(&config);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(env_filter(&directive));

    let (file_layer, log_file) = match config.log_file.as_deref().map(open_log_file) {
        Some(Ok(file)) => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_writer(Mutex::new(file))
                .with_filter(env_filter(&directive));
            (Some(layer), config.log_file.clone())
        }
        Some(Err(e)) => {
            eprintln!("quill-telemetry: failed to open log file: {e}");
            (None, None)
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    TelemetryGuard {
        log_file,
        installed,
    }
}

/// Parse a level name case-insensitively.
pub fn parse_level(name: &str) -> Option<Level> {
    name.trim().parse().ok()
}

fn filter_directive(config: &TelemetryConfig) -> String {
    let mut filter_str = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter_str
}

fn env_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
