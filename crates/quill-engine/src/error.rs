use std::io::ErrorKind;
use std::path::PathBuf;

use quill_core::PersistError;

#[derive(Debug, thiserror::Error)]
pub enum NarrativeError {
    #[error("narrative io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl NarrativeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Interrupted or timed-out writes may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io { source, .. } => matches!(
                source.kind(),
                ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
            ),
        }
    }
}

impl From<NarrativeError> for PersistError {
    fn from(e: NarrativeError) -> Self {
        if e.is_transient() {
            PersistError::TransientStore(e.to_string())
        } else {
            PersistError::SinkUnavailable(e.to_string())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failure queue io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failure queue serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
