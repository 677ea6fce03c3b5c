//! Applies one hook event to both sinks.
//!
//! The store and the narrative are written independently. Each write runs
//! under the retry policy; a write that still fails is queued for replay
//! and never stops the other sink.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};

use quill_core::{BackupRecord, FailureId, GenericEvent, PersistError, Role};
use quill_settings::{load_project_settings, NarrativeSettings, QuillSettings};
use quill_store::{
    Connection, Database, EventRepo, MessageRepo, SessionRepo, StoreError, StoreOptions, ToolRepo,
};

use crate::error::QueueError;
use crate::hook::{status_for_end_reason, HookInput, HookKind, UNKNOWN_PROJECT};
use crate::narrative::{NarrativeBlock, NarrativeLog, SessionRef};
use crate::queue::{FailedEventRecord, FailureQueue, ReplayReport, Sink};
use crate::resolver::{NarrativePointers, SessionResolver};
use crate::retry::{with_retry, RetryOutcome, RetryPolicy};
use crate::tools::{tool_succeeded, ToolInput};
use crate::transcript::{backup_transcript, last_assistant_text};

/// A hook payload plus everything derived from it once, up front.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub raw: Value,
    pub received_at: DateTime<Utc>,
    /// Transcript copy taken for PreCompact.
    pub backup_path: Option<String>,
    /// Whether this is the first session seen for the project, when known.
    pub first_in_project: Option<bool>,
    /// Final assistant text read from the transcript on Stop.
    pub assistant_text: Option<String>,
}

impl Envelope {
    fn new(raw: Value, hook: &HookInput, received_at: DateTime<Utc>) -> Self {
        let assistant_text = match hook.kind() {
            HookKind::Stop => hook
                .transcript_path
                .as_deref()
                .and_then(|path| last_assistant_text(Path::new(path))),
            _ => None,
        };
        Self {
            raw,
            received_at,
            backup_path: None,
            first_in_project: None,
            assistant_text,
        }
    }
}

/// What happened to one sink's write.
#[derive(Clone, Debug, PartialEq)]
pub enum SinkOutcome {
    Written { attempts: u32 },
    /// Sink disabled by configuration.
    Skipped,
    /// Retries exhausted; the event is in the failure queue.
    Queued { error: PersistError, attempts: u32 },
    /// Retries exhausted and the failure queue could not be written either.
    Lost { error: PersistError, attempts: u32 },
}

impl SinkOutcome {
    pub fn error(&self) -> Option<&PersistError> {
        match self {
            Self::Queued { error, .. } | Self::Lost { error, .. } => Some(error),
            Self::Written { .. } | Self::Skipped => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProcessOutcome {
    /// False when the project opted out and nothing was recorded.
    pub enabled: bool,
    pub strict: bool,
    pub store: SinkOutcome,
    pub narrative: SinkOutcome,
}

impl ProcessOutcome {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            strict: false,
            store: SinkOutcome::Skipped,
            narrative: SinkOutcome::Skipped,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = (Sink, &PersistError)> {
        [(Sink::Store, &self.store), (Sink::Narrative, &self.narrative)]
            .into_iter()
            .filter_map(|(sink, outcome)| outcome.error().map(|e| (sink, e)))
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }

    /// Exhausted retries that must be surfaced to the caller.
    pub fn strict_failure(&self) -> bool {
        self.strict && self.has_failures()
    }
}

pub struct Engine {
    settings: QuillSettings,
    narratives: Mutex<HashMap<PathBuf, Arc<NarrativeLog>>>,
}

impl Engine {
    pub fn new(settings: QuillSettings) -> Self {
        Self {
            settings,
            narratives: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &QuillSettings {
        &self.settings
    }

    /// Parse and process raw stdin text.
    pub fn handle_raw(&self, raw: &str) -> Result<ProcessOutcome, PersistError> {
        let value = HookInput::parse_raw(raw)?;
        self.process(value)
    }

    /// Process one hook payload. Only malformed input is an error; sink
    /// failures are reported in the outcome.
    #[instrument(skip_all)]
    pub fn process(&self, raw: Value) -> Result<ProcessOutcome, PersistError> {
        let hook = HookInput::from_value(&raw)?;
        let project = hook.project();
        let Some(settings) = self.project_settings(&project) else {
            debug!(project = %project, "recording disabled for project");
            return Ok(ProcessOutcome::disabled());
        };

        let kind = hook.kind();
        let received_at = Utc::now();
        let mut envelope = Envelope::new(raw, &hook, received_at);
        match kind {
            HookKind::SessionStart => {
                envelope.first_in_project = self.first_contact(&settings, &project);
            }
            HookKind::PreCompact if settings.backup.enabled => {
                envelope.backup_path = self.backup(&hook, &settings, &received_at);
            }
            _ => {}
        }
        debug!(session_id = %hook.session_id(), event = ?kind, project = %project, "processing event");

        let policy = RetryPolicy::from_settings(&settings.retry);
        let store = self.run_sink(Sink::Store, &envelope, &hook, &settings, &policy);
        let narrative = if settings.narrative.enabled {
            self.run_sink(Sink::Narrative, &envelope, &hook, &settings, &policy)
        } else {
            SinkOutcome::Skipped
        };

        Ok(ProcessOutcome {
            enabled: true,
            strict: settings.retry.strict,
            store,
            narrative,
        })
    }

    /// Apply one event to one sink, without retry.
    pub fn apply(
        &self,
        sink: Sink,
        envelope: &Envelope,
        hook: &HookInput,
        settings: &QuillSettings,
    ) -> Result<(), PersistError> {
        match sink {
            Sink::Store => self.apply_store(envelope, hook, settings),
            Sink::Narrative => self.apply_narrative(envelope, hook, settings),
        }
    }

    /// Retry every queued write under the settings of its project.
    pub fn replay_failures(&self) -> Result<ReplayReport, QueueError> {
        self.failure_queue().replay_all(
            |record| {
                let settings = self.replay_settings(record.project.as_deref());
                RetryPolicy::from_settings(&settings.retry)
            },
            |record| {
                let hook = HookInput::from_value(&record.event)?;
                let settings = self.replay_settings(Some(&hook.project()));
                let mut envelope = Envelope::new(record.event.clone(), &hook, record.received_at);
                envelope.backup_path = record.backup_path.clone();
                self.apply(record.sink, &envelope, &hook, &settings)
            },
        )
    }

    /// The installation-wide failure queue.
    pub fn failure_queue(&self) -> FailureQueue {
        FailureQueue::new(self.settings.queue.path.clone(), self.settings.queue.capacity)
    }

    /// Open (or reuse) the structured store named by `settings`.
    pub fn store(&self, settings: &QuillSettings) -> Result<Database, PersistError> {
        let options = StoreOptions {
            busy_timeout: Duration::from_millis(settings.store.busy_timeout_ms),
        };
        Ok(Database::shared(&settings.store.path, &options)?)
    }

    fn run_sink(
        &self,
        sink: Sink,
        envelope: &Envelope,
        hook: &HookInput,
        settings: &QuillSettings,
        policy: &RetryPolicy,
    ) -> SinkOutcome {
        let (error, attempts) =
            match with_retry(policy, |_| self.apply(sink, envelope, hook, settings)) {
                RetryOutcome::Succeeded { attempts, .. } => return SinkOutcome::Written { attempts },
                RetryOutcome::Exhausted { error, attempts } => (error, attempts),
            };

        error!(
            %sink,
            session_id = %hook.session_id(),
            kind = error.error_kind(),
            attempts,
            %error,
            "write failed, queueing event"
        );
        let record = FailedEventRecord {
            id: FailureId::new(),
            sink,
            event: envelope.raw.clone(),
            received_at: envelope.received_at,
            project: Some(hook.project()),
            backup_path: envelope.backup_path.clone(),
            failed_at: Utc::now(),
            error: error.to_string(),
            attempts,
        };
        match self.failure_queue().enqueue(record) {
            Ok(_) => SinkOutcome::Queued { error, attempts },
            Err(queue_error) => {
                error!(%sink, error = %queue_error, "failure queue unwritable, event lost");
                SinkOutcome::Lost { error, attempts }
            }
        }
    }

    /// All of one event's rows commit in a single transaction.
    #[instrument(skip_all, fields(session_id = %hook.session_id()))]
    fn apply_store(
        &self,
        envelope: &Envelope,
        hook: &HookInput,
        settings: &QuillSettings,
    ) -> Result<(), PersistError> {
        let db = self.store(settings)?;
        db.with_tx(|tx| write_store_rows(tx, envelope, hook, &settings.interface))?;
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %hook.session_id()))]
    fn apply_narrative(
        &self,
        envelope: &Envelope,
        hook: &HookInput,
        settings: &QuillSettings,
    ) -> Result<(), PersistError> {
        let narrative = self.narrative_for(&settings.narrative);
        let repo = match self.store(settings) {
            Ok(db) => Some(SessionRepo::new(db)),
            Err(e) => {
                debug!(error = %e, "store unavailable for narrative pointers");
                None
            }
        };
        let pointers = repo.as_ref().map(|repo| repo as &dyn NarrativePointers);

        let id = hook.session_id();
        let project = hook.project();
        let session = SessionRef {
            id: &id,
            project: &project,
            at: envelope.received_at,
        };
        let kind = hook.kind();

        let block = match &kind {
            HookKind::SessionStart => {
                let path = narrative.init(
                    pointers,
                    session,
                    hook.source.as_deref(),
                    envelope.first_in_project,
                )?;
                debug!(path = %path.display(), "narrative opened");
                return Ok(());
            }
            HookKind::SessionEnd => {
                let reason = hook.reason.as_deref();
                let _ = narrative.finalize(pointers, session, status_for_end_reason(reason), reason)?;
                return Ok(());
            }
            HookKind::UserPromptSubmit => NarrativeBlock::User {
                prompt: hook.prompt.as_deref().unwrap_or_default(),
            },
            HookKind::PreToolUse => NarrativeBlock::ToolCall(ToolInput::parse(
                hook.tool_name(),
                hook.tool_input.as_ref(),
            )),
            HookKind::PostToolUse => NarrativeBlock::ToolResult {
                tool_name: hook.tool_name(),
                success: tool_succeeded(hook.tool_response.as_ref()),
            },
            HookKind::Notification => NarrativeBlock::Notification {
                message: hook.message.as_deref().unwrap_or_default(),
            },
            HookKind::PreCompact => NarrativeBlock::Compaction {
                trigger: hook.trigger.as_deref().unwrap_or("unknown"),
                instructions: hook.custom_instructions.as_deref(),
                backup_path: envelope.backup_path.as_deref(),
            },
            HookKind::Stop => match envelope.assistant_text.as_deref() {
                Some(text) => NarrativeBlock::Assistant { text },
                None => return Ok(()),
            },
            HookKind::SubagentStop => NarrativeBlock::SubagentStop,
            HookKind::Other(name) => NarrativeBlock::Generic { event_type: name },
        };
        let _ = narrative.append(pointers, session, &block)?;
        Ok(())
    }

    fn narrative_for(&self, settings: &NarrativeSettings) -> Arc<NarrativeLog> {
        let mut logs = self.narratives.lock();
        logs.entry(settings.base_dir.clone())
            .or_insert_with(|| {
                Arc::new(NarrativeLog::new(SessionResolver::new(
                    settings.base_dir.clone(),
                    settings.scan_days,
                )))
            })
            .clone()
    }

    /// Effective settings for `project`, or `None` when it opted out.
    fn project_settings(&self, project: &str) -> Option<QuillSettings> {
        if project == UNKNOWN_PROJECT {
            return Some(self.settings.clone());
        }
        let effective = load_project_settings(&self.settings, Path::new(project));
        effective.enabled.then_some(effective.settings)
    }

    /// Settings for replaying a queued write. Opt-outs made after the
    /// failure do not discard it.
    fn replay_settings(&self, project: Option<&str>) -> QuillSettings {
        match project {
            Some(project) if project != UNKNOWN_PROJECT => {
                load_project_settings(&self.settings, Path::new(project)).settings
            }
            _ => self.settings.clone(),
        }
    }

    fn first_contact(&self, settings: &QuillSettings, project: &str) -> Option<bool> {
        let db = self.store(settings).ok()?;
        match SessionRepo::new(db).exists_for_project(project) {
            Ok(exists) => Some(!exists),
            Err(e) => {
                debug!(error = %e, "first-contact check failed");
                None
            }
        }
    }

    fn backup(
        &self,
        hook: &HookInput,
        settings: &QuillSettings,
        at: &DateTime<Utc>,
    ) -> Option<String> {
        let source = hook.transcript_path.as_deref()?;
        let trigger = hook.trigger.as_deref().unwrap_or("unknown");
        match backup_transcript(
            Path::new(source),
            &settings.backup.dir,
            &hook.session_id(),
            trigger,
            at,
        ) {
            Ok(path) => {
                info!(backup = %path.display(), trigger, "transcript backed up");
                Some(path.to_string_lossy().into_owned())
            }
            Err(e) => {
                warn!(source, error = %e, "transcript backup failed");
                None
            }
        }
    }
}

fn write_store_rows(
    conn: &Connection,
    envelope: &Envelope,
    hook: &HookInput,
    interface: &str,
) -> Result<(), StoreError> {
    let id = hook.session_id();
    let project = hook.project();
    let kind = hook.kind();
    let at = envelope.received_at;
    let event = GenericEvent {
        event_type: kind.event_type(),
        subtype: None,
        tool_name: None,
        message: None,
        metadata: None,
        timestamp: at,
    };

    match &kind {
        HookKind::SessionStart => {
            SessionRepo::upsert_in(conn, &id, &project, &at, interface)?;
            let _ = EventRepo::record_in(
                conn,
                &id,
                &project,
                &GenericEvent {
                    subtype: hook.source.clone(),
                    ..event
                },
            )?;
        }
        HookKind::SessionEnd => {
            let reason = hook.reason.as_deref();
            SessionRepo::end_in(conn, &id, &project, status_for_end_reason(reason), &at, reason)?;
            let _ = EventRepo::record_in(
                conn,
                &id,
                &project,
                &GenericEvent {
                    subtype: hook.reason.clone(),
                    ..event
                },
            )?;
        }
        HookKind::UserPromptSubmit => {
            let prompt = hook.prompt.as_deref().unwrap_or_default();
            let _ = MessageRepo::append_in(conn, &id, &project, Role::User, prompt, &at)?;
        }
        HookKind::PreToolUse => {
            let input = ToolInput::parse(hook.tool_name(), hook.tool_input.as_ref());
            let _ = ToolRepo::record_invocation_in(
                conn,
                &id,
                &project,
                input.name(),
                &input.summary(),
                &at,
            )?;
        }
        HookKind::PostToolUse => {
            let success = tool_succeeded(hook.tool_response.as_ref());
            let _ =
                ToolRepo::record_result_in(conn, &id, &project, hook.tool_name(), success, &at)?;
        }
        HookKind::Notification => {
            let _ = EventRepo::record_in(
                conn,
                &id,
                &project,
                &GenericEvent {
                    message: hook.message.clone(),
                    ..event
                },
            )?;
        }
        HookKind::PreCompact => {
            let trigger = hook.trigger.clone().unwrap_or_else(|| "unknown".into());
            let metadata = hook
                .custom_instructions
                .as_ref()
                .map(|instructions| json!({ "custom_instructions": instructions }));
            let _ = EventRepo::record_in(
                conn,
                &id,
                &project,
                &GenericEvent {
                    subtype: Some(trigger.clone()),
                    metadata,
                    ..event
                },
            )?;
            if let Some(source) = &hook.transcript_path {
                let backup = BackupRecord {
                    trigger,
                    source_path: source.clone(),
                    backup_path: envelope.backup_path.clone(),
                    timestamp: at,
                };
                let _ = EventRepo::record_backup_in(conn, &id, &project, &backup)?;
            }
        }
        HookKind::Stop => {
            let _ = EventRepo::record_in(
                conn,
                &id,
                &project,
                &GenericEvent {
                    metadata: hook
                        .stop_hook_active
                        .map(|active| json!({ "stop_hook_active": active })),
                    ..event
                },
            )?;
            if let Some(text) = &envelope.assistant_text {
                let _ = MessageRepo::append_in(conn, &id, &project, Role::Assistant, text, &at)?;
            }
        }
        HookKind::SubagentStop => {
            let _ = EventRepo::record_in(conn, &id, &project, &event)?;
        }
        HookKind::Other(_) => {
            let _ = EventRepo::record_in(
                conn,
                &id,
                &project,
                &GenericEvent {
                    tool_name: hook.tool_name.clone(),
                    message: hook.message.clone(),
                    metadata: Some(envelope.raw.clone()),
                    ..event
                },
            )?;
        }
    }
    Ok(())
}
