pub mod database;
pub mod error;
pub mod events;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod tools;

pub use database::{Database, StoreOptions};
pub use error::StoreError;
pub use events::EventRepo;
pub use messages::MessageRepo;
pub use sessions::{SessionRepo, SessionRow};
pub use tools::{ToolRepo, ToolResultMatch, ToolStats};

/// Lets callers run several repo writes inside one `Database::with_tx`.
pub use rusqlite::Connection;
