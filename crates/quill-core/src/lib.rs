pub mod errors;
pub mod events;
pub mod ids;

pub use errors::PersistError;
pub use events::{
    format_timestamp, BackupRecord, Event, GenericEvent, Message, Role, SessionStatus,
    ToolInvocation,
};
pub use ids::{FailureId, SessionId};
