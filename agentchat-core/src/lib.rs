//! # agentchat-core
//!
//! Core library for agentchat - a multi-provider agent chat runtime.
//!
//! This library provides:
//! - Catalog profiles (providers, models, prompts, agents) and descriptor assembly
//! - Provider dispatch onto OpenAI-compatible and Anthropic backends
//! - Prompt assembly from a system template and bounded session history
//! - Synchronous and streaming conversation turns with usage and cost accounting
//! - SQLite storage, configuration and logging infrastructure
//!
//! ## Turn lifecycle
//!
//! A turn resolves an agent into a [`ChatModelDescriptor`], selects a runtime
//! through the [`ProviderDispatcher`], persists the user message, invokes the
//! backend and persists the assistant message with its [`UsageRecord`].
//! Reference and configuration errors abort before any write; backend
//! failures are recorded as `ERROR` messages.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentchat_core::{ChatOrchestrator, Config, Database, ProviderDispatcher, SendRequest};
//!
//! # async fn run() -> agentchat_core::Result<()> {
//! let config = Config::load()?;
//! let db = Arc::new(Database::open(&Config::database_path())?);
//! db.migrate()?;
//!
//! let dispatcher = ProviderDispatcher::new(&config);
//! let chat = ChatOrchestrator::new(db, dispatcher, &config);
//! let turn = chat
//!     .send(SendRequest {
//!         user_id: 1,
//!         agent_id: 7,
//!         content: "Hello".into(),
//!         ..Default::default()
//!     })
//!     .await?;
//! println!("{:?}", turn.assistant_message.content);
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use catalog::{Catalog, ImportSummary};
pub use chat::{ChatOrchestrator, SendRequest, StreamEvent, TurnResult};
pub use config::Config;
pub use db::{Database, UsageSummary};
pub use descriptor::DescriptorAssembler;
pub use dispatch::{ProviderDispatcher, ProviderKind, RuntimeContext};
pub use error::{Error, Result};
pub use prompt::PromptAssembler;
pub use segment::{Segment, SegmentType};
pub use types::*;

// Public modules
pub mod catalog;
pub mod chat;
pub mod config;
pub mod db;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod llm;
pub mod logging;
pub mod options;
pub mod prompt;
pub mod segment;
pub mod types;
pub mod usage;
