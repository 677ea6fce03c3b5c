use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Local;
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::schema;

/// Suffixes of the side files SQLite keeps next to a WAL-mode database.
const SIDE_FILE_SUFFIXES: [&str; 2] = ["-wal", "-shm"];

/// Connection options applied on every open.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// How long to wait for another process's write lock before failing with Busy.
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of the pre-open integrity check.
#[derive(Debug, PartialEq, Eq)]
enum Integrity {
    Ok,
    Corrupt(String),
    /// The check itself could not run (e.g. another writer held the lock).
    Unknown(String),
}

/// Thread-safe SQLite connection wrapper.
/// Uses parking_lot::Mutex for synchronous access (rusqlite is not Sync).
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

static OPEN_STORES: OnceLock<Mutex<HashMap<PathBuf, Database>>> = OnceLock::new();

impl Database {
    /// Open or create a database at the given path with default options.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with(path, &StoreOptions::default())
    }

    /// Open or create a database, recovering from corruption.
    ///
    /// An existing file that fails its integrity check is renamed aside
    /// (together with its `-wal`/`-shm` files) and a fresh, empty store is
    /// created in its place.
    pub fn open_with(path: &Path, options: &StoreOptions) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        }

        if path.exists() {
            match check_integrity(path, options) {
                Integrity::Ok => {}
                Integrity::Corrupt(detail) => {
                    warn!(path = %path.display(), detail = %detail, "store failed integrity check");
                    let backup = quarantine(path)?;
                    warn!(path = %path.display(), backup = %backup.display(), "corrupt store moved aside");
                }
                Integrity::Unknown(detail) => {
                    warn!(path = %path.display(), detail = %detail, "integrity check skipped");
                }
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(options.busy_timeout)?;
        initialize(&conn)?;

        info!(path = %path.display(), "database opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_owned(),
        })
    }

    /// Return the process-wide handle for `path`, opening it on first use.
    pub fn shared(path: &Path, options: &StoreOptions) -> Result<Self, StoreError> {
        let stores = OPEN_STORES.get_or_init(|| Mutex::new(HashMap::new()));
        let mut stores = stores.lock();
        if let Some(db) = stores.get(path) {
            return Ok(db.clone());
        }
        let db = Self::open_with(path, options)?;
        let _ = stores.insert(path.to_owned(), db.clone());
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        initialize(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Run SQLite's quick check against the open connection.
    pub fn integrity_ok(&self) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let result: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
            Ok(result == "ok")
        })
    }

    /// Execute a closure with the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a closure inside an IMMEDIATE transaction.
    ///
    /// The write lock is taken up front so a concurrent writer waits on the
    /// busy timeout instead of failing mid-transaction.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            path: self.path.clone(),
        }
    }
}

fn initialize(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(schema::PRAGMAS)
        .map_err(|e| with_context(e, "pragmas"))?;
    conn.execute_batch(schema::CREATE_TABLES)
        .map_err(|e| with_context(e, "schema"))?;
    conn.execute(
        "INSERT INTO schema_version (version)
         SELECT ?1 WHERE NOT EXISTS (SELECT 1 FROM schema_version)",
        [schema::SCHEMA_VERSION],
    )
    .map_err(|e| with_context(e, "schema version"))?;
    Ok(())
}

fn with_context(e: rusqlite::Error, what: &str) -> StoreError {
    match StoreError::from(e) {
        StoreError::Database(msg) => StoreError::Database(format!("{what}: {msg}")),
        other => other,
    }
}

fn check_integrity(path: &Path, options: &StoreOptions) -> Integrity {
    let conn = match Connection::open(path) {
        Ok(conn) => conn,
        Err(e) => return classify_check_error(e),
    };
    if let Err(e) = conn.busy_timeout(options.busy_timeout) {
        return classify_check_error(e);
    }
    match conn.query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0)) {
        Ok(result) if result == "ok" => Integrity::Ok,
        Ok(result) => Integrity::Corrupt(result),
        Err(e) => classify_check_error(e),
    }
}

fn classify_check_error(e: rusqlite::Error) -> Integrity {
    match StoreError::from(e) {
        StoreError::Corrupt(detail) => Integrity::Corrupt(detail),
        other => Integrity::Unknown(other.to_string()),
    }
}

/// Rename a corrupt store and its side files to `<name>.corrupt-YYYYmmdd-HHMMSS`.
/// Returns the new path of the main file.
fn quarantine(path: &Path) -> Result<PathBuf, StoreError> {
    let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let backup = unused_backup_path(path, &stamp);
    std::fs::rename(path, &backup)
        .map_err(|e| StoreError::Io(format!("quarantine {}: {e}", path.display())))?;

    for suffix in SIDE_FILE_SUFFIXES {
        let side = append_to_file_name(path, suffix);
        if side.exists() {
            let side_backup = append_to_file_name(&backup, suffix);
            if let Err(e) = std::fs::rename(&side, &side_backup) {
                warn!(path = %side.display(), error = %e, "failed to move side file aside");
                let _ = std::fs::remove_file(&side);
            }
        }
    }
    Ok(backup)
}

fn unused_backup_path(path: &Path, stamp: &str) -> PathBuf {
    let first = append_to_file_name(path, &format!(".corrupt-{stamp}"));
    if !first.exists() {
        return first;
    }
    (1..)
        .map(|n| append_to_file_name(path, &format!(".corrupt-{stamp}-{n}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(first)
}

fn append_to_file_name(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(db: &Database) -> Vec<String> {
        db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .unwrap()
    }

    fn corrupt_backups(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("quill.db.corrupt-"))
            .collect()
    }

    #[test]
    fn open_in_memory() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.path(), Path::new(":memory:"));
    }

    #[test]
    fn tables_created() {
        let db = Database::in_memory().unwrap();
        let tables = table_names(&db);
        for expected in ["sessions", "messages", "tool_invocations", "events", "backups"] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn schema_version_set_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quill.db");
        drop(Database::open(&path).unwrap());
        let db = Database::open(&path).unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("quill.db")).unwrap();
        let mode: String = db
            .with_conn(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[test]
    fn healthy_store_is_not_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quill.db");
        drop(Database::open(&path).unwrap());
        let db = Database::open(&path).unwrap();
        assert!(db.integrity_ok().unwrap());
        assert!(corrupt_backups(dir.path()).is_empty());
    }

    #[test]
    fn corrupt_store_is_moved_aside_and_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quill.db");
        std::fs::write(&path, vec![0x5a_u8; 8192]).unwrap();
        std::fs::write(append_to_file_name(&path, "-wal"), b"junk").unwrap();

        let db = Database::open(&path).unwrap();

        let backups = corrupt_backups(dir.path());
        assert!(
            backups.iter().any(|n| !n.ends_with("-wal") && !n.ends_with("-shm")),
            "no backup in {backups:?}"
        );
        assert!(db.integrity_ok().unwrap());
        let sessions: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(sessions, 0);
    }

    #[test]
    fn damaged_header_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quill.db");
        {
            let db = Database::open(&path).unwrap();
            db.with_conn(|conn| {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                Ok(())
            })
            .unwrap();
        }
        let bytes = std::fs::read(&path).unwrap();
        let mut damaged = bytes[..16].to_vec();
        damaged.extend(std::iter::repeat(0xff).take(bytes.len().saturating_sub(16).max(4096)));
        std::fs::write(&path, damaged).unwrap();

        let db = Database::open(&path).unwrap();
        assert!(db.integrity_ok().unwrap());
        assert!(!corrupt_backups(dir.path()).is_empty());
    }

    #[test]
    fn backup_names_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quill.db");
        let first = unused_backup_path(&path, "20260101-000000");
        std::fs::write(&first, b"x").unwrap();
        let second = unused_backup_path(&path, "20260101-000000");
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with(".corrupt-20260101-000000-1"));
    }

    #[test]
    fn shared_returns_same_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quill.db");
        let a = Database::shared(&path, &StoreOptions::default()).unwrap();
        let b = Database::shared(&path, &StoreOptions::default()).unwrap();
        assert!(Arc::ptr_eq(&a.conn, &b.conn));
    }
}
