//! Database layer for agentchat
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Repository pattern for queries
//! - Per-turn transactions for conversation writes

pub mod repo;
pub mod schema;

pub use repo::{Database, UsageSummary};
