use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use quill_core::{format_timestamp, SessionId, ToolInvocation};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::sessions::ensure_session;

/// How a tool result was attached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolResultMatch {
    /// Completed the most recent open invocation of that tool.
    Matched { invocation_id: i64, duration_ms: i64 },
    /// No open invocation existed; a completed row was inserted.
    Inserted { invocation_id: i64 },
}

/// Aggregated usage for one tool name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolStats {
    pub tool_name: String,
    pub invocations: i64,
    pub successes: i64,
    pub failures: i64,
    /// Successes as a percentage of completed invocations; 0 when none completed.
    pub success_rate: f64,
}

pub struct ToolRepo {
    db: Database,
}

impl ToolRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record the start of a tool call.
    #[instrument(skip(self, input_summary), fields(session_id = %session_id, tool_name))]
    pub fn record_invocation(
        &self,
        session_id: &SessionId,
        project: &str,
        tool_name: &str,
        input_summary: &str,
        started_at: &DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.db.with_tx(|tx| {
            Self::record_invocation_in(tx, session_id, project, tool_name, input_summary, started_at)
        })
    }

    pub fn record_invocation_in(
        conn: &Connection,
        session_id: &SessionId,
        project: &str,
        tool_name: &str,
        input_summary: &str,
        started_at: &DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let ts = format_timestamp(started_at);
        ensure_session(conn, session_id, project, &ts)?;
        conn.execute(
            "INSERT INTO tool_invocations (session_id, tool_name, input_summary, started_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![session_id.as_str(), tool_name, input_summary, ts],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Attach a result to the most recently started, still-open invocation
    /// of `tool_name` in this session.
    ///
    /// Calls carry no correlation id, so two overlapping calls of the same
    /// tool may be paired with each other's results.
    #[instrument(skip(self), fields(session_id = %session_id, tool_name, success))]
    pub fn record_result(
        &self,
        session_id: &SessionId,
        project: &str,
        tool_name: &str,
        success: bool,
        completed_at: &DateTime<Utc>,
    ) -> Result<ToolResultMatch, StoreError> {
        self.db.with_tx(|tx| {
            Self::record_result_in(tx, session_id, project, tool_name, success, completed_at)
        })
    }

    pub fn record_result_in(
        conn: &Connection,
        session_id: &SessionId,
        project: &str,
        tool_name: &str,
        success: bool,
        completed_at: &DateTime<Utc>,
    ) -> Result<ToolResultMatch, StoreError> {
        let ts = format_timestamp(completed_at);
        ensure_session(conn, session_id, project, &ts)?;
        let open: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, started_at FROM tool_invocations
                 WHERE session_id = ?1 AND tool_name = ?2 AND completed_at IS NULL
                 ORDER BY id DESC LIMIT 1",
                rusqlite::params![session_id.as_str(), tool_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((invocation_id, started_at)) = open else {
            debug!(tool_name, "no open invocation, recording result on its own");
            conn.execute(
                "INSERT INTO tool_invocations
                    (session_id, tool_name, input_summary, success, started_at, completed_at)
                 VALUES (?1, ?2, '', ?3, ?4, ?4)",
                rusqlite::params![session_id.as_str(), tool_name, success, ts],
            )?;
            return Ok(ToolResultMatch::Inserted {
                invocation_id: conn.last_insert_rowid(),
            });
        };

        let started = row_helpers::parse_timestamp(&started_at, "tool_invocations", "started_at")?;
        let duration_ms = (*completed_at - started).num_milliseconds().max(0);
        conn.execute(
            "UPDATE tool_invocations
             SET success = ?1, duration_ms = ?2, completed_at = ?3
             WHERE id = ?4",
            rusqlite::params![success, duration_ms, ts, invocation_id],
        )?;
        Ok(ToolResultMatch::Matched {
            invocation_id,
            duration_ms,
        })
    }

    /// Tool invocations for a session in start order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<ToolInvocation>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tool_name, input_summary, success, duration_ms, started_at
                 FROM tool_invocations WHERE session_id = ?1
                 ORDER BY started_at ASC, id ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let ts: String = row_helpers::get(row, 4, "tool_invocations", "started_at")?;
                results.push(ToolInvocation {
                    name: row_helpers::get(row, 0, "tool_invocations", "tool_name")?,
                    input_summary: row_helpers::get(row, 1, "tool_invocations", "input_summary")?,
                    success: row_helpers::get_opt(row, 2, "tool_invocations", "success")?,
                    duration_ms: row_helpers::get_opt(row, 3, "tool_invocations", "duration_ms")?,
                    timestamp: row_helpers::parse_timestamp(&ts, "tool_invocations", "started_at")?,
                });
            }
            Ok(results)
        })
    }

    /// Per-tool usage, most used first. `None` aggregates across all sessions.
    #[instrument(skip(self))]
    pub fn stats(&self, session_id: Option<&SessionId>) -> Result<Vec<ToolStats>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tool_name,
                        COUNT(*),
                        COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0)
                 FROM tool_invocations
                 WHERE ?1 IS NULL OR session_id = ?1
                 GROUP BY tool_name
                 ORDER BY COUNT(*) DESC, tool_name ASC",
            )?;
            let mut rows = stmt.query([session_id.map(SessionId::as_str)])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let successes: i64 = row_helpers::get(row, 2, "tool_invocations", "successes")?;
                let failures: i64 = row_helpers::get(row, 3, "tool_invocations", "failures")?;
                results.push(ToolStats {
                    tool_name: row_helpers::get(row, 0, "tool_invocations", "tool_name")?,
                    invocations: row_helpers::get(row, 1, "tool_invocations", "count")?,
                    successes,
                    failures,
                    success_rate: success_rate(successes, failures),
                });
            }
            Ok(results)
        })
    }
}

fn success_rate(successes: i64, failures: i64) -> f64 {
    let completed = successes + failures;
    if completed == 0 {
        return 0.0;
    }
    (successes as f64 * 100.0 / completed as f64 * 100.0).round() / 100.0
}
