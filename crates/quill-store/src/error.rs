use quill_core::PersistError;
use rusqlite::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database busy: {0}")]
    Busy(String),

    #[error("database corrupt: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl StoreError {
    /// Lock timeouts and OS-level failures may clear up on a later attempt.
    /// Other SQLite errors (missing table, constraint violation) will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::Io(_))
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt(_) | Self::CorruptRow { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                StoreError::Busy(e.to_string())
            }
            Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) => {
                StoreError::Corrupt(e.to_string())
            }
            Some(
                ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::CannotOpen
                | ErrorCode::ReadOnly,
            ) => StoreError::Io(e.to_string()),
            _ => StoreError::Database(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<StoreError> for PersistError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Busy(_) | StoreError::Io(_) => PersistError::TransientStore(e.to_string()),
            StoreError::Corrupt(_) | StoreError::CorruptRow { .. } => {
                PersistError::CorruptStore(e.to_string())
            }
            StoreError::Serialization(_) => PersistError::MalformedInput(e.to_string()),
            StoreError::Database(_) | StoreError::NotFound(_) => {
                PersistError::SinkUnavailable(e.to_string())
            }
        }
    }
}
