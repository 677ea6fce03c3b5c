use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use quill_core::{format_timestamp, SessionId, SessionStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub project: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub status: SessionStatus,
    pub message_count: i64,
    pub interface: Option<String>,
    pub narrative_path: Option<String>,
    pub end_reason: Option<String>,
    pub updated_at: String,
}

const SESSION_COLUMNS: &str = "id, project, started_at, ended_at, status, message_count,
     interface, narrative_path, end_reason, updated_at";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the session or refresh it if it already exists.
    #[instrument(skip(self), fields(session_id = %id, project))]
    pub fn upsert(
        &self,
        id: &SessionId,
        project: &str,
        started_at: &DateTime<Utc>,
        interface: &str,
    ) -> Result<(), StoreError> {
        self.db
            .with_tx(|tx| Self::upsert_in(tx, id, project, started_at, interface))
    }

    /// [`upsert`](Self::upsert) on a caller-held connection.
    ///
    /// A start later than the recorded end reactivates the session. A start
    /// from before the end (a replayed write) leaves the ended session alone.
    /// Message count, start time and narrative pointer are preserved.
    pub fn upsert_in(
        conn: &Connection,
        id: &SessionId,
        project: &str,
        started_at: &DateTime<Utc>,
        interface: &str,
    ) -> Result<(), StoreError> {
        let ts = format_timestamp(started_at);
        conn.execute(
            "INSERT INTO sessions (id, project, started_at, status, interface, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?3)
             ON CONFLICT(id) DO UPDATE SET
                project = excluded.project,
                interface = excluded.interface,
                status = CASE WHEN sessions.ended_at IS NULL OR excluded.started_at > sessions.ended_at
                              THEN 'active' ELSE sessions.status END,
                end_reason = CASE WHEN sessions.ended_at IS NULL OR excluded.started_at > sessions.ended_at
                                  THEN NULL ELSE sessions.end_reason END,
                ended_at = CASE WHEN sessions.ended_at IS NULL OR excluded.started_at > sessions.ended_at
                                THEN NULL ELSE sessions.ended_at END,
                updated_at = MAX(sessions.updated_at, excluded.updated_at)",
            rusqlite::params![id.as_str(), project, ts, interface],
        )?;
        Ok(())
    }

    /// Get a session by ID.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.find(id)?
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn find(&self, id: &SessionId) -> Result<Option<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row).map(Some),
                None => Ok(None),
            }
        })
    }

    /// Most recently started sessions first.
    #[instrument(skip(self))]
    pub fn list_recent(&self, limit: u32) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 ORDER BY started_at DESC, id DESC LIMIT ?1"
            ))?;
            let mut rows = stmt.query([limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Whether any session has been recorded for `project`.
    #[instrument(skip(self))]
    pub fn exists_for_project(&self, project: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM sessions WHERE project = ?1 LIMIT 1",
                    [project],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Mark a session finished.
    #[instrument(skip(self), fields(session_id = %id, status = %status))]
    pub fn end(
        &self,
        id: &SessionId,
        project: &str,
        status: SessionStatus,
        ended_at: &DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        self.db
            .with_tx(|tx| Self::end_in(tx, id, project, status, ended_at, reason))
    }

    pub fn end_in(
        conn: &Connection,
        id: &SessionId,
        project: &str,
        status: SessionStatus,
        ended_at: &DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let ts = format_timestamp(ended_at);
        ensure_session(conn, id, project, &ts)?;
        conn.execute(
            "UPDATE sessions SET status = ?1, ended_at = ?2, end_reason = ?3, updated_at = ?2
             WHERE id = ?4",
            rusqlite::params![status.to_string(), ts, reason, id.as_str()],
        )?;
        Ok(())
    }

    /// Stored narrative log path, if any.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn narrative_path(&self, id: &SessionId) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            let path: Option<Option<String>> = conn
                .query_row(
                    "SELECT narrative_path FROM sessions WHERE id = ?1",
                    [id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(path.flatten())
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn set_narrative_path(
        &self,
        id: &SessionId,
        project: &str,
        path: &str,
    ) -> Result<(), StoreError> {
        let now = format_timestamp(&Utc::now());
        self.db.with_tx(|conn| {
            ensure_session(conn, id, project, &now)?;
            conn.execute(
                "UPDATE sessions SET narrative_path = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![path, now, id.as_str()],
            )?;
            Ok(())
        })
    }
}

/// Insert a placeholder session row if `id` is unseen.
///
/// Every write that references a session goes through here first so no
/// event row can exist without its session.
pub(crate) fn ensure_session(
    conn: &Connection,
    id: &SessionId,
    project: &str,
    now: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO sessions (id, project, started_at, status, updated_at)
         VALUES (?1, ?2, ?3, 'active', ?3)",
        rusqlite::params![id.as_str(), project, now],
    )?;
    Ok(())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let status_str: String = row_helpers::get(row, 4, "sessions", "status")?;

    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        project: row_helpers::get(row, 1, "sessions", "project")?,
        started_at: row_helpers::get(row, 2, "sessions", "started_at")?,
        ended_at: row_helpers::get_opt(row, 3, "sessions", "ended_at")?,
        status: row_helpers::parse_enum(&status_str, "sessions", "status")?,
        message_count: row_helpers::get(row, 5, "sessions", "message_count")?,
        interface: row_helpers::get_opt(row, 6, "sessions", "interface")?,
        narrative_path: row_helpers::get_opt(row, 7, "sessions", "narrative_path")?,
        end_reason: row_helpers::get_opt(row, 8, "sessions", "end_reason")?,
        updated_at: row_helpers::get(row, 9, "sessions", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_790_000_000 + secs, 0).unwrap()
    }

    fn setup() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn upsert_creates_active_session() {
        let repo = setup();
        let id = SessionId::from_raw("abc12345");
        repo.upsert(&id, "/p", &at(0), "cli").unwrap();
        let row = repo.get(&id).unwrap();
        assert_eq!(row.project, "/p");
        assert_eq!(row.status, SessionStatus::Active);
        assert_eq!(row.message_count, 0);
        assert_eq!(row.interface.as_deref(), Some("cli"));
        assert!(row.ended_at.is_none());
    }

    #[test]
    fn upsert_is_idempotent_and_preserves_start() {
        let repo = setup();
        let id = SessionId::from_raw("abc12345");
        repo.upsert(&id, "/p", &at(0), "cli").unwrap();
        repo.set_narrative_path(&id, "/p", "/logs/a.md").unwrap();
        repo.upsert(&id, "/p", &at(60), "cli").unwrap();

        let row = repo.get(&id).unwrap();
        assert_eq!(row.started_at, format_timestamp(&at(0)));
        assert_eq!(row.narrative_path.as_deref(), Some("/logs/a.md"));
        assert_eq!(repo.list_recent(10).unwrap().len(), 1);
    }

    #[test]
    fn end_sets_status_and_timestamp() {
        let repo = setup();
        let id = SessionId::from_raw("abc12345");
        repo.upsert(&id, "/p", &at(0), "cli").unwrap();
        repo.end(&id, "/p", SessionStatus::Completed, &at(30), Some("logout")).unwrap();

        let row = repo.get(&id).unwrap();
        assert_eq!(row.status, SessionStatus::Completed);
        assert_eq!(row.ended_at.as_deref(), Some(format_timestamp(&at(30)).as_str()));
        assert_eq!(row.end_reason.as_deref(), Some("logout"));
    }

    #[test]
    fn restart_after_end_reactivates() {
        let repo = setup();
        let id = SessionId::from_raw("abc12345");
        repo.upsert(&id, "/p", &at(0), "cli").unwrap();
        repo.end(&id, "/p", SessionStatus::Completed, &at(30), None).unwrap();
        repo.upsert(&id, "/p", &at(60), "cli").unwrap();
        let row = repo.get(&id).unwrap();
        assert_eq!(row.status, SessionStatus::Active);
        assert!(row.ended_at.is_none());
    }

    #[test]
    fn stale_start_does_not_reopen_ended_session() {
        let repo = setup();
        let id = SessionId::from_raw("abc12345");
        repo.end(&id, "/p", SessionStatus::Completed, &at(30), Some("logout")).unwrap();
        repo.upsert(&id, "/p", &at(0), "cli").unwrap();

        let row = repo.get(&id).unwrap();
        assert_eq!(row.status, SessionStatus::Completed);
        assert_eq!(row.ended_at.as_deref(), Some(format_timestamp(&at(30)).as_str()));
        assert_eq!(row.end_reason.as_deref(), Some("logout"));
        assert_eq!(row.interface.as_deref(), Some("cli"));
    }

    #[test]
    fn end_creates_missing_session() {
        let repo = setup();
        let id = SessionId::from_raw("orphan01");
        repo.end(&id, "/p", SessionStatus::Interrupted, &at(5), None).unwrap();
        assert_eq!(repo.get(&id).unwrap().status, SessionStatus::Interrupted);
    }

    #[test]
    fn get_nonexistent_fails() {
        let repo = setup();
        let result = repo.get(&SessionId::from_raw("missing"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert!(repo.find(&SessionId::from_raw("missing")).unwrap().is_none());
    }

    #[test]
    fn list_recent_orders_and_limits() {
        let repo = setup();
        for i in 0..5 {
            repo.upsert(&SessionId::from_raw(format!("s{i}")), "/p", &at(i), "cli").unwrap();
        }
        let recent = repo.list_recent(3).unwrap();
        let ids: Vec<&str> = recent.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["s4", "s3", "s2"]);
    }

    #[test]
    fn project_existence_is_scoped() {
        let repo = setup();
        assert!(!repo.exists_for_project("/p").unwrap());
        repo.upsert(&SessionId::from_raw("a"), "/p", &at(0), "cli").unwrap();
        assert!(repo.exists_for_project("/p").unwrap());
        assert!(!repo.exists_for_project("/q").unwrap());
    }

    #[test]
    fn narrative_pointer_roundtrip() {
        let repo = setup();
        let id = SessionId::from_raw("abc12345");
        assert!(repo.narrative_path(&id).unwrap().is_none());
        repo.set_narrative_path(&id, "/p", "/logs/2026-10-18/01_120000_abc12345_p.md").unwrap();
        assert_eq!(
            repo.narrative_path(&id).unwrap().as_deref(),
            Some("/logs/2026-10-18/01_120000_abc12345_p.md")
        );
    }

    #[test]
    fn invalid_session_status_returns_error() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, project, started_at, status, updated_at)
                 VALUES ('bad', '/p', 'x', 'INVALID_STATUS', 'x')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let repo = SessionRepo::new(db);
        let result = repo.get(&SessionId::from_raw("bad"));
        assert!(matches!(result, Err(StoreError::CorruptRow { .. })));
    }
}
