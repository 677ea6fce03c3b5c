//! # quill-engine
//!
//! Turns agent hook events into durable records: rows in the structured
//! store and blocks in the per-session narrative log. Writes are retried,
//! and writes that keep failing land in a capped failure queue for replay.

#![deny(unsafe_code)]

pub mod engine;
pub mod error;
pub mod hook;
pub mod narrative;
pub mod queue;
pub mod reply;
pub mod resolver;
pub mod retry;
pub mod tools;
pub mod transcript;

pub use engine::{Engine, Envelope, ProcessOutcome, SinkOutcome};
pub use error::{NarrativeError, QueueError};
pub use hook::{HookInput, HookKind};
pub use narrative::{NarrativeBlock, NarrativeLog, SessionRef};
pub use queue::{FailedEventRecord, FailureQueue, ReplayReport, Sink};
pub use reply::HookReply;
pub use resolver::{NarrativePointers, NarrativeTarget, SessionResolver, TargetOrigin};
pub use retry::{with_retry, RetryOutcome, RetryPolicy};
pub use tools::ToolInput;
