//! # quill
//!
//! Hook binary. With no subcommand (or `hook`) it reads one event from
//! stdin, records it, and prints the hook reply. The other subcommands
//! inspect what has been recorded.

#![deny(unsafe_code)]

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, warn};

use quill_core::SessionId;
use quill_engine::{Engine, HookReply};
use quill_settings::{load_settings, load_settings_from_path, QuillSettings};
use quill_store::{EventRepo, SessionRepo, ToolRepo};
use quill_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "quill", about = "Session ledger for agent hook events")]
struct Cli {
    /// Settings file (defaults to ~/.quill/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record one hook event read from stdin (the default).
    Hook,
    /// Retry every write in the failure queue.
    Replay,
    /// Show the failure queue.
    Queue,
    /// List recent sessions.
    Sessions {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Per-tool usage statistics.
    Stats {
        /// Restrict to one session.
        #[arg(long)]
        session: Option<String>,
    },
    /// Everything recorded for one session, in time order.
    Events { session_id: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = match &cli.settings {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    };
    let (settings, settings_error) = match loaded {
        Ok(settings) => (settings, None),
        Err(e) => (QuillSettings::default(), Some(e)),
    };
    let _telemetry = init_telemetry(TelemetryConfig::from_level_name(
        &settings.logging.level,
        settings.logging.file.clone(),
    ));
    if let Some(e) = settings_error {
        warn!(error = %e, "settings unreadable, using defaults");
    }

    let engine = Engine::new(settings);
    let result = match cli.command {
        None | Some(Command::Hook) => return run_hook(&engine),
        Some(Command::Replay) => replay(&engine),
        Some(Command::Queue) => show_queue(&engine),
        Some(Command::Sessions { limit }) => list_sessions(&engine, limit),
        Some(Command::Stats { session }) => tool_stats(&engine, session),
        Some(Command::Events { session_id }) => session_events(&engine, session_id),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Process stdin as a hook event. Only a strict-mode failure exits non-zero.
fn run_hook(engine: &Engine) -> ExitCode {
    let mut input = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut input) {
        warn!(error = %e, "could not read stdin");
        return ExitCode::SUCCESS;
    }
    if input.trim().is_empty() {
        debug!("empty input");
        return ExitCode::SUCCESS;
    }

    let outcome = match engine.handle_raw(&input) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(kind = e.error_kind(), error = %e, "dropping event");
            return ExitCode::SUCCESS;
        }
    };

    let reply = HookReply::from_outcome(&outcome);
    match serde_json::to_string(&reply) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!(error = %e, "could not encode reply"),
    }

    if outcome.strict_failure() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn replay(engine: &Engine) -> Result<()> {
    let report = engine.replay_failures().context("replaying failure queue")?;
    print_json(&report)
}

fn show_queue(engine: &Engine) -> Result<()> {
    let records = engine.failure_queue().load().context("reading failure queue")?;
    print_json(&records)
}

fn list_sessions(engine: &Engine, limit: u32) -> Result<()> {
    let db = engine.store(engine.settings()).context("opening store")?;
    print_json(&SessionRepo::new(db).list_recent(limit)?)
}

fn tool_stats(engine: &Engine, session: Option<String>) -> Result<()> {
    let db = engine.store(engine.settings()).context("opening store")?;
    let session = session.map(SessionId::from_raw);
    print_json(&ToolRepo::new(db).stats(session.as_ref())?)
}

fn session_events(engine: &Engine, session_id: String) -> Result<()> {
    let db = engine.store(engine.settings()).context("opening store")?;
    print_json(&EventRepo::new(db).timeline(&SessionId::from_raw(session_id))?)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
