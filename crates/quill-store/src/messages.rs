use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::instrument;

use quill_core::{format_timestamp, Message, Role, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::sessions::ensure_session;

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message and bump the session's counter in one transaction.
    #[instrument(skip(self, content), fields(session_id = %session_id, role = %role))]
    pub fn append(
        &self,
        session_id: &SessionId,
        project: &str,
        role: Role,
        content: &str,
        timestamp: &DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.db
            .with_tx(|tx| Self::append_in(tx, session_id, project, role, content, timestamp))
    }

    pub fn append_in(
        conn: &Connection,
        session_id: &SessionId,
        project: &str,
        role: Role,
        content: &str,
        timestamp: &DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let ts = format_timestamp(timestamp);
        ensure_session(conn, session_id, project, &ts)?;
        conn.execute(
            "INSERT INTO messages (session_id, role, content, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![session_id.as_str(), role.to_string(), content, ts],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "UPDATE sessions SET message_count = message_count + 1, updated_at = ?1
             WHERE id = ?2",
            rusqlite::params![ts, session_id.as_str()],
        )?;
        Ok(id)
    }

    /// Messages for a session in timestamp order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT role, content, timestamp FROM messages
                 WHERE session_id = ?1 ORDER BY timestamp ASC, id ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let role: String = row_helpers::get(row, 0, "messages", "role")?;
                let ts: String = row_helpers::get(row, 2, "messages", "timestamp")?;
                results.push(Message {
                    role: row_helpers::parse_enum(&role, "messages", "role")?,
                    content: row_helpers::get(row, 1, "messages", "content")?,
                    timestamp: row_helpers::parse_timestamp(&ts, "messages", "timestamp")?,
                });
            }
            Ok(results)
        })
    }

    /// Number of stored message rows for a session.
    pub fn count(&self, session_id: &SessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;

    #[test]
    fn message_count_tracks_rows() {
        let db = Database::in_memory().unwrap();
        let messages = MessageRepo::new(db.clone());
        let sessions = SessionRepo::new(db);
        let id = SessionId::from_raw("abc12345");

        for n in 0..7 {
            let role = if n % 2 == 0 { Role::User } else { Role::Assistant };
            messages.append(&id, "/p", role, &format!("m{n}"), &Utc::now()).unwrap();
        }

        assert_eq!(messages.count(&id).unwrap(), 7);
        assert_eq!(sessions.get(&id).unwrap().message_count, 7);
    }

    #[test]
    fn append_creates_session_implicitly() {
        let db = Database::in_memory().unwrap();
        let messages = MessageRepo::new(db.clone());
        let id = SessionId::from_raw("fresh001");
        messages.append(&id, "/p", Role::User, "hi", &Utc::now()).unwrap();
        let row = SessionRepo::new(db).get(&id).unwrap();
        assert_eq!(row.project, "/p");
        assert_eq!(row.message_count, 1);
    }

    #[test]
    fn list_returns_messages_in_order() {
        let db = Database::in_memory().unwrap();
        let messages = MessageRepo::new(db);
        let id = SessionId::from_raw("abc12345");
        let t0 = Utc::now();
        messages
            .append(&id, "/p", Role::Assistant, "second", &(t0 + chrono::Duration::seconds(1)))
            .unwrap();
        messages.append(&id, "/p", Role::User, "first", &t0).unwrap();

        let listed = messages.list(&id).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].content, "first");
        assert_eq!(listed[0].role, Role::User);
        assert_eq!(listed[1].role, Role::Assistant);
    }

    #[test]
    fn concurrent_writers_keep_count_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quill.db");
        drop(Database::open(&path).unwrap());

        let writers = 4;
        let per_writer = 25;
        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let path = path.clone();
                std::thread::spawn(move || {
                    // Independent connection per thread, like separate processes.
                    let db = Database::open(&path).unwrap();
                    let repo = MessageRepo::new(db);
                    let id = SessionId::from_raw("shared01");
                    for i in 0..per_writer {
                        repo.append(&id, "/p", Role::User, &format!("{w}-{i}"), &Utc::now())
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let db = Database::open(&path).unwrap();
        let id = SessionId::from_raw("shared01");
        let expected = (writers * per_writer) as i64;
        assert_eq!(MessageRepo::new(db.clone()).count(&id).unwrap(), expected);
        assert_eq!(SessionRepo::new(db).get(&id).unwrap().message_count, expected);
    }
}
