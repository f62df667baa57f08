//! Conversation runtime: turn orchestration, streaming events, session locks

pub mod events;
pub mod locks;
pub mod orchestrator;

pub use events::{StreamEvent, UsageMetadata};
pub use locks::SessionLocks;
pub use orchestrator::{ChatOrchestrator, SendRequest, TurnResult, MODEL_INVOCATION_ERROR};
