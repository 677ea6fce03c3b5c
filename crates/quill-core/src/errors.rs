/// Failure taxonomy shared by both sinks.
/// Only transient store errors are worth another attempt.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PersistError {
    #[error("transient store error: {0}")]
    TransientStore(String),

    #[error("store is corrupt: {0}")]
    CorruptStore(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("sink unavailable: {0}")]
    SinkUnavailable(String),
}

impl PersistError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::TransientStore(_) => "transient_store",
            Self::CorruptStore(_) => "corrupt_store",
            Self::MalformedInput(_) => "malformed_input",
            Self::SinkUnavailable(_) => "sink_unavailable",
        }
    }
}
