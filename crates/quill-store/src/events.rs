use rusqlite::Connection;
use tracing::instrument;

use quill_core::{format_timestamp, BackupRecord, Event, GenericEvent, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::messages::MessageRepo;
use crate::row_helpers;
use crate::sessions::ensure_session;
use crate::tools::ToolRepo;

pub struct EventRepo {
    db: Database,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, event), fields(session_id = %session_id, event_type = %event.event_type))]
    pub fn record(
        &self,
        session_id: &SessionId,
        project: &str,
        event: &GenericEvent,
    ) -> Result<i64, StoreError> {
        self.db
            .with_tx(|tx| Self::record_in(tx, session_id, project, event))
    }

    pub fn record_in(
        conn: &Connection,
        session_id: &SessionId,
        project: &str,
        event: &GenericEvent,
    ) -> Result<i64, StoreError> {
        let ts = format_timestamp(&event.timestamp);
        let metadata = event
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        ensure_session(conn, session_id, project, &ts)?;
        conn.execute(
            "INSERT INTO events (session_id, event_type, subtype, tool_name, message, metadata, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                session_id.as_str(),
                event.event_type,
                event.subtype,
                event.tool_name,
                event.message,
                metadata,
                ts,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    #[instrument(skip(self, backup), fields(session_id = %session_id, trigger = %backup.trigger))]
    pub fn record_backup(
        &self,
        session_id: &SessionId,
        project: &str,
        backup: &BackupRecord,
    ) -> Result<i64, StoreError> {
        self.db
            .with_tx(|tx| Self::record_backup_in(tx, session_id, project, backup))
    }

    pub fn record_backup_in(
        conn: &Connection,
        session_id: &SessionId,
        project: &str,
        backup: &BackupRecord,
    ) -> Result<i64, StoreError> {
        let ts = format_timestamp(&backup.timestamp);
        ensure_session(conn, session_id, project, &ts)?;
        conn.execute(
            "INSERT INTO backups (session_id, trigger, source_path, backup_path, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                session_id.as_str(),
                backup.trigger,
                backup.source_path,
                backup.backup_path,
                ts,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_generic(&self, session_id: &SessionId) -> Result<Vec<GenericEvent>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT event_type, subtype, tool_name, message, metadata, timestamp
                 FROM events WHERE session_id = ?1 ORDER BY timestamp ASC, id ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let metadata: Option<String> = row_helpers::get_opt(row, 4, "events", "metadata")?;
                let ts: String = row_helpers::get(row, 5, "events", "timestamp")?;
                results.push(GenericEvent {
                    event_type: row_helpers::get(row, 0, "events", "event_type")?,
                    subtype: row_helpers::get_opt(row, 1, "events", "subtype")?,
                    tool_name: row_helpers::get_opt(row, 2, "events", "tool_name")?,
                    message: row_helpers::get_opt(row, 3, "events", "message")?,
                    metadata: metadata
                        .map(|raw| row_helpers::parse_json(&raw, "events", "metadata"))
                        .transpose()?,
                    timestamp: row_helpers::parse_timestamp(&ts, "events", "timestamp")?,
                });
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_backups(&self, session_id: &SessionId) -> Result<Vec<BackupRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT trigger, source_path, backup_path, timestamp
                 FROM backups WHERE session_id = ?1 ORDER BY timestamp ASC, id ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let ts: String = row_helpers::get(row, 3, "backups", "timestamp")?;
                results.push(BackupRecord {
                    trigger: row_helpers::get(row, 0, "backups", "trigger")?,
                    source_path: row_helpers::get(row, 1, "backups", "source_path")?,
                    backup_path: row_helpers::get_opt(row, 2, "backups", "backup_path")?,
                    timestamp: row_helpers::parse_timestamp(&ts, "backups", "timestamp")?,
                });
            }
            Ok(results)
        })
    }

    /// Every event recorded for a session, ordered by timestamp.
    pub fn timeline(&self, session_id: &SessionId) -> Result<Vec<Event>, StoreError> {
        let mut events: Vec<Event> = MessageRepo::new(self.db.clone())
            .list(session_id)?
            .into_iter()
            .map(Event::Message)
            .collect();
        events.extend(
            ToolRepo::new(self.db.clone())
                .list(session_id)?
                .into_iter()
                .map(Event::ToolInvocation),
        );
        events.extend(self.list_generic(session_id)?.into_iter().map(Event::Generic));
        events.extend(self.list_backups(session_id)?.into_iter().map(Event::Backup));
        // Stable sort keeps per-table insertion order for equal timestamps.
        events.sort_by(|a, b| a.timestamp().cmp(b.timestamp()));
        Ok(events)
    }
}
