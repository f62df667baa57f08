//! Database repository layer
//!
//! Provides query and insert operations for catalog profiles, sessions,
//! messages and usage records. Every multi-row write of a turn runs in a
//! single transaction.

use crate::catalog::{Catalog, ImportSummary};
use crate::error::{Error, Result};
use crate::segment;
use crate::types::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Aggregated usage for one session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageSummary {
    /// Number of model invocations
    pub calls: i64,
    /// Invocations that failed
    pub failures: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: Decimal,
}

/// Fixed-width UTC timestamps so text ordering matches time ordering
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_decimal(s: Option<String>) -> Option<Decimal> {
    s.and_then(|s| s.parse::<Decimal>().ok())
}

/// Database handle (single connection behind a mutex)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ============================================
    // Catalog operations
    // ============================================

    /// Insert or update a provider profile
    pub fn upsert_provider(&self, provider: &ProviderProfile) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        write_provider(&conn, provider)
    }

    pub fn get_provider(&self, id: i64) -> Result<Option<ProviderProfile>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM providers WHERE id = ?",
            [id],
            Self::row_to_provider,
        )
        .optional()
        .map_err(Error::from)
    }

    fn row_to_provider(row: &Row) -> rusqlite::Result<ProviderProfile> {
        Ok(ProviderProfile {
            id: row.get("id")?,
            code: row.get("code")?,
            name: row.get("name")?,
            base_url: row.get("base_url")?,
            api_key: row.get("api_key")?,
            rate_limit_rpm: row.get("rate_limit_rpm")?,
            enabled: row.get("enabled")?,
        })
    }

    /// Insert or update a model profile
    pub fn upsert_model(&self, model: &ModelProfile) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        write_model(&conn, model)
    }

    pub fn get_model(&self, id: i64) -> Result<Option<ModelProfile>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM models WHERE id = ?", [id], Self::row_to_model)
            .optional()
            .map_err(Error::from)
    }

    fn row_to_model(row: &Row) -> rusqlite::Result<ModelProfile> {
        Ok(ModelProfile {
            id: row.get("id")?,
            provider_id: row.get("provider_id")?,
            model_key: row.get("model_key")?,
            display_name: row.get("display_name")?,
            context_window: row.get("context_window")?,
            max_output_tokens: row.get("max_output_tokens")?,
            input_price_per_1k: parse_decimal(row.get("input_price_per_1k")?),
            output_price_per_1k: parse_decimal(row.get("output_price_per_1k")?),
            currency: row.get("currency")?,
            supports_tools: row.get("supports_tools")?,
            supports_vision: row.get("supports_vision")?,
            supports_structured_output: row.get("supports_structured_output")?,
            default_temperature: row.get("default_temperature")?,
            default_top_p: row.get("default_top_p")?,
        })
    }

    /// Insert or update a prompt template
    pub fn upsert_prompt(&self, prompt: &PromptTemplate) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        write_prompt(&conn, prompt)
    }

    pub fn get_prompt(&self, id: i64) -> Result<Option<PromptTemplate>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, content FROM prompts WHERE id = ?",
            [id],
            |row| {
                Ok(PromptTemplate {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    content: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    /// Insert or update an agent, replacing its tool and advisor lists
    pub fn upsert_agent(&self, agent: &AgentProfile) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        write_agent(&tx, agent)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_agent(&self, id: i64) -> Result<Option<AgentProfile>> {
        let conn = self.conn.lock().unwrap();
        let agent = conn
            .query_row("SELECT * FROM agents WHERE id = ?", [id], Self::row_to_agent)
            .optional()?;

        let Some(mut agent) = agent else {
            return Ok(None);
        };

        agent.tool_ids = ordered_ids(
            &conn,
            "SELECT tool_id FROM agent_tools WHERE agent_id = ? ORDER BY position",
            id,
        )?;
        agent.advisor_ids = ordered_ids(
            &conn,
            "SELECT advisor_id FROM agent_advisors WHERE agent_id = ? ORDER BY position",
            id,
        )?;
        Ok(Some(agent))
    }

    fn row_to_agent(row: &Row) -> rusqlite::Result<AgentProfile> {
        Ok(AgentProfile {
            id: row.get("id")?,
            name: row.get("name")?,
            model_id: row.get("model_id")?,
            prompt_id: row.get("prompt_id")?,
            temperature: row.get("temperature")?,
            top_p: row.get("top_p")?,
            presence_penalty: row.get("presence_penalty")?,
            frequency_penalty: row.get("frequency_penalty")?,
            max_tokens: row.get("max_tokens")?,
            stop_sequences: row.get("stop_sequences")?,
            tool_choice: row.get("tool_choice")?,
            tool_ids: Vec::new(),
            advisor_ids: Vec::new(),
        })
    }

    /// Import a whole catalog in one transaction
    pub fn import_catalog(&self, catalog: &Catalog) -> Result<ImportSummary> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        for provider in &catalog.providers {
            write_provider(&tx, provider)?;
        }
        for model in &catalog.models {
            write_model(&tx, model)?;
        }
        for prompt in &catalog.prompts {
            write_prompt(&tx, prompt)?;
        }
        for agent in &catalog.agents {
            write_agent(&tx, agent)?;
        }

        tx.commit()?;
        Ok(catalog.summary())
    }

    // ============================================
    // Session operations
    // ============================================

    /// Create a session and return it with its assigned ID
    pub fn create_session(&self, user_id: i64, agent_id: i64, title: &str) -> Result<ChatSession> {
        let conn = self.conn.lock().unwrap();
        let created_at = Utc::now();
        conn.execute(
            r#"
            INSERT INTO chat_sessions (user_id, agent_id, title, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![user_id, agent_id, title, ts(&created_at)],
        )?;

        Ok(ChatSession {
            id: conn.last_insert_rowid(),
            user_id,
            agent_id,
            title: title.to_string(),
            pinned: false,
            archived: false,
            deleted: false,
            message_count: 0,
            token_count: 0,
            last_message_time: None,
            created_at,
        })
    }

    /// Get a session by ID regardless of owner or deletion state
    pub fn get_session(&self, id: i64) -> Result<Option<ChatSession>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM chat_sessions WHERE id = ?",
            [id],
            Self::row_to_session,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Get an undeleted session owned by `user_id`
    pub fn find_user_session(&self, id: i64, user_id: i64) -> Result<Option<ChatSession>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM chat_sessions WHERE id = ?1 AND user_id = ?2 AND deleted = 0",
            params![id, user_id],
            Self::row_to_session,
        )
        .optional()
        .map_err(Error::from)
    }

    /// List a user's undeleted sessions, pinned first, then most recent
    pub fn list_user_sessions(&self, user_id: i64) -> Result<Vec<ChatSession>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM chat_sessions
            WHERE user_id = ? AND deleted = 0
            ORDER BY pinned DESC, COALESCE(last_message_time, created_at) DESC, id DESC
            "#,
        )?;

        let sessions = stmt
            .query_map([user_id], Self::row_to_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// Pin or unpin a session. Returns false when no owned session matched.
    pub fn set_session_pinned(&self, id: i64, user_id: i64, pinned: bool) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE chat_sessions SET pinned = ?1 WHERE id = ?2 AND user_id = ?3 AND deleted = 0",
            params![pinned, id, user_id],
        )?;
        Ok(changed > 0)
    }

    /// Soft-delete a session. Returns false when no owned session matched.
    pub fn soft_delete_session(&self, id: i64, user_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE chat_sessions SET deleted = 1 WHERE id = ?1 AND user_id = ?2 AND deleted = 0",
            params![id, user_id],
        )?;
        Ok(changed > 0)
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<ChatSession> {
        let last_message_str: Option<String> = row.get("last_message_time")?;
        let created_at_str: String = row.get("created_at")?;

        Ok(ChatSession {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            agent_id: row.get("agent_id")?,
            title: row.get("title")?,
            pinned: row.get("pinned")?,
            archived: row.get("archived")?,
            deleted: row.get("deleted")?,
            message_count: row.get("message_count")?,
            token_count: row.get("token_count")?,
            last_message_time: last_message_str.as_deref().map(parse_ts),
            created_at: parse_ts(&created_at_str),
        })
    }

    // ============================================
    // Message operations
    // ============================================

    /// Persist a user message with its attachments and bump the session's
    /// message count, all in one transaction.
    pub fn insert_user_message(&self, message: &ChatMessage) -> Result<ChatMessage> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        // Counters first: a missing session fails before any row is written
        bump_session(&tx, message.session_id, message.token_delta(), &message.created_at)?;
        let id = write_message(&tx, message)?;
        let mut attachments = Vec::with_capacity(message.attachments.len());
        for attachment in &message.attachments {
            let mut attachment = attachment.clone();
            attachment.message_id = id;
            attachment.id = write_attachment(&tx, &attachment)?;
            attachments.push(attachment);
        }

        tx.commit()?;

        let mut stored = message.clone();
        stored.id = id;
        stored.attachments = attachments;
        Ok(stored)
    }

    /// Persist the assistant message, the session counters and the usage
    /// record of a finished turn in one transaction.
    pub fn complete_turn(
        &self,
        message: &ChatMessage,
        usage: &UsageRecord,
    ) -> Result<(ChatMessage, UsageRecord)> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        bump_session(&tx, message.session_id, message.token_delta(), &message.created_at)?;
        let message_id = write_message(&tx, message)?;
        let usage_id = write_usage(&tx, usage)?;

        tx.commit()?;

        let mut stored_message = message.clone();
        stored_message.id = message_id;
        let mut stored_usage = usage.clone();
        stored_usage.id = usage_id;
        Ok((stored_message, stored_usage))
    }

    /// ID of the newest message in a session, used as the next parent
    pub fn last_message_id(&self, session_id: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id FROM chat_messages WHERE session_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
            [session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    /// Most recent `limit` messages of a session, newest first
    pub fn recent_messages(&self, session_id: i64, limit: usize) -> Result<Vec<ChatMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM chat_messages
            WHERE session_id = ?1
            ORDER BY created_at DESC, id DESC
            LIMIT ?2
            "#,
        )?;

        let messages = stmt
            .query_map(params![session_id, limit as i64], Self::row_to_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    /// All messages of a session in chronological order, with attachments
    pub fn session_messages(&self, session_id: i64) -> Result<Vec<ChatMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM chat_messages WHERE session_id = ? ORDER BY created_at ASC, id ASC",
        )?;
        let mut messages = stmt
            .query_map([session_id], Self::row_to_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT a.* FROM chat_attachments a
            JOIN chat_messages m ON m.id = a.message_id
            WHERE m.session_id = ?
            ORDER BY a.id
            "#,
        )?;
        let mut by_message: HashMap<i64, Vec<Attachment>> = HashMap::new();
        for attachment in stmt.query_map([session_id], Self::row_to_attachment)? {
            let attachment = attachment?;
            by_message
                .entry(attachment.message_id)
                .or_default()
                .push(attachment);
        }

        for message in &mut messages {
            if let Some(attachments) = by_message.remove(&message.id) {
                message.attachments = attachments;
            }
        }
        Ok(messages)
    }

    fn row_to_message(row: &Row) -> rusqlite::Result<ChatMessage> {
        let role_str: String = row.get("role")?;
        let type_str: String = row.get("message_type")?;
        let segments_str: String = row.get("segments")?;
        let created_at_str: String = row.get("created_at")?;

        Ok(ChatMessage {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            parent_id: row.get("parent_id")?,
            role: role_str.parse().unwrap_or(MessageRole::User),
            message_type: type_str.parse().unwrap_or(MessageType::Normal),
            segments: segment::from_storage(&segments_str),
            content: row.get("content")?,
            status: row.get("status")?,
            finish_reason: row.get("finish_reason")?,
            input_tokens: row.get("input_tokens")?,
            output_tokens: row.get("output_tokens")?,
            latency_ms: row.get("latency_ms")?,
            cost: parse_decimal(row.get("cost")?),
            error_code: row.get("error_code")?,
            error_message: row.get("error_message")?,
            created_at: parse_ts(&created_at_str),
            attachments: Vec::new(),
        })
    }

    fn row_to_attachment(row: &Row) -> rusqlite::Result<Attachment> {
        Ok(Attachment {
            id: row.get("id")?,
            message_id: row.get("message_id")?,
            file_name: row.get("file_name")?,
            url: row.get("url")?,
            mime_type: row.get("mime_type")?,
            size_bytes: row.get("size_bytes")?,
        })
    }

    // ============================================
    // Usage operations
    // ============================================

    /// Usage records of a session in insertion order
    pub fn usage_for_session(&self, session_id: i64) -> Result<Vec<UsageRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM usage_logs WHERE session_id = ? ORDER BY id ASC")?;
        let records = stmt
            .query_map([session_id], Self::row_to_usage)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Totals over a session's usage records
    pub fn usage_summary(&self, session_id: i64) -> Result<UsageSummary> {
        let records = self.usage_for_session(session_id)?;
        Ok(records.iter().fold(UsageSummary::default(), |mut acc, r| {
            acc.calls += 1;
            if !r.success {
                acc.failures += 1;
            }
            acc.input_tokens += i64::from(r.input_tokens.unwrap_or(0));
            acc.output_tokens += i64::from(r.output_tokens.unwrap_or(0));
            acc.cost += r.cost.unwrap_or_default();
            acc
        }))
    }

    fn row_to_usage(row: &Row) -> rusqlite::Result<UsageRecord> {
        let operation_str: String = row.get("operation")?;
        let created_at_str: String = row.get("created_at")?;

        Ok(UsageRecord {
            id: row.get("id")?,
            request_id: row.get("request_id")?,
            session_id: row.get("session_id")?,
            user_id: row.get("user_id")?,
            provider: row.get("provider")?,
            model: row.get("model")?,
            operation: operation_str.parse().unwrap_or(OperationKind::Chat),
            input_tokens: row.get("input_tokens")?,
            output_tokens: row.get("output_tokens")?,
            cost: parse_decimal(row.get("cost")?),
            currency: row.get("currency")?,
            success: row.get("success")?,
            latency_ms: row.get("latency_ms")?,
            error_message: row.get("error_message")?,
            created_at: parse_ts(&created_at_str),
        })
    }
}

// ============================================
// Statement helpers (shared by single writes and transactions)
// ============================================

fn write_provider(conn: &Connection, provider: &ProviderProfile) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO providers (id, code, name, base_url, api_key, rate_limit_rpm, enabled)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(id) DO UPDATE SET
            code = excluded.code,
            name = excluded.name,
            base_url = excluded.base_url,
            api_key = excluded.api_key,
            rate_limit_rpm = excluded.rate_limit_rpm,
            enabled = excluded.enabled
        "#,
        params![
            provider.id,
            provider.code,
            provider.name,
            provider.base_url,
            provider.api_key,
            provider.rate_limit_rpm,
            provider.enabled,
        ],
    )?;
    Ok(())
}

fn write_model(conn: &Connection, model: &ModelProfile) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO models (id, provider_id, model_key, display_name, context_window, max_output_tokens,
                            input_price_per_1k, output_price_per_1k, currency, supports_tools,
                            supports_vision, supports_structured_output, default_temperature, default_top_p)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        ON CONFLICT(id) DO UPDATE SET
            provider_id = excluded.provider_id,
            model_key = excluded.model_key,
            display_name = excluded.display_name,
            context_window = excluded.context_window,
            max_output_tokens = excluded.max_output_tokens,
            input_price_per_1k = excluded.input_price_per_1k,
            output_price_per_1k = excluded.output_price_per_1k,
            currency = excluded.currency,
            supports_tools = excluded.supports_tools,
            supports_vision = excluded.supports_vision,
            supports_structured_output = excluded.supports_structured_output,
            default_temperature = excluded.default_temperature,
            default_top_p = excluded.default_top_p
        "#,
        params![
            model.id,
            model.provider_id,
            model.model_key,
            model.display_name,
            model.context_window,
            model.max_output_tokens,
            model.input_price_per_1k.map(|p| p.to_string()),
            model.output_price_per_1k.map(|p| p.to_string()),
            model.currency,
            model.supports_tools,
            model.supports_vision,
            model.supports_structured_output,
            model.default_temperature,
            model.default_top_p,
        ],
    )?;
    Ok(())
}

fn write_prompt(conn: &Connection, prompt: &PromptTemplate) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO prompts (id, name, content) VALUES (?1, ?2, ?3)
        ON CONFLICT(id) DO UPDATE SET name = excluded.name, content = excluded.content
        "#,
        params![prompt.id, prompt.name, prompt.content],
    )?;
    Ok(())
}

fn write_agent(conn: &Connection, agent: &AgentProfile) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO agents (id, name, model_id, prompt_id, temperature, top_p, presence_penalty,
                            frequency_penalty, max_tokens, stop_sequences, tool_choice)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            model_id = excluded.model_id,
            prompt_id = excluded.prompt_id,
            temperature = excluded.temperature,
            top_p = excluded.top_p,
            presence_penalty = excluded.presence_penalty,
            frequency_penalty = excluded.frequency_penalty,
            max_tokens = excluded.max_tokens,
            stop_sequences = excluded.stop_sequences,
            tool_choice = excluded.tool_choice
        "#,
        params![
            agent.id,
            agent.name,
            agent.model_id,
            agent.prompt_id,
            agent.temperature,
            agent.top_p,
            agent.presence_penalty,
            agent.frequency_penalty,
            agent.max_tokens,
            agent.stop_sequences,
            agent.tool_choice,
        ],
    )?;

    conn.execute("DELETE FROM agent_tools WHERE agent_id = ?", [agent.id])?;
    for (position, tool_id) in agent.tool_ids.iter().enumerate() {
        conn.execute(
            "INSERT INTO agent_tools (agent_id, position, tool_id) VALUES (?1, ?2, ?3)",
            params![agent.id, position as i64, tool_id],
        )?;
    }

    conn.execute("DELETE FROM agent_advisors WHERE agent_id = ?", [agent.id])?;
    for (position, advisor_id) in agent.advisor_ids.iter().enumerate() {
        conn.execute(
            "INSERT INTO agent_advisors (agent_id, position, advisor_id) VALUES (?1, ?2, ?3)",
            params![agent.id, position as i64, advisor_id],
        )?;
    }
    Ok(())
}

fn ordered_ids(conn: &Connection, sql: &str, agent_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map([agent_id], |r| r.get(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;
    Ok(ids)
}

fn write_message(conn: &Connection, message: &ChatMessage) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO chat_messages (session_id, parent_id, role, message_type, segments, content, status,
                                   finish_reason, input_tokens, output_tokens, latency_ms, cost,
                                   error_code, error_message, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#,
        params![
            message.session_id,
            message.parent_id,
            message.role.as_str(),
            message.message_type.as_str(),
            segment::to_storage(&message.segments)?,
            message.content,
            message.status,
            message.finish_reason,
            message.input_tokens,
            message.output_tokens,
            message.latency_ms,
            message.cost.map(|c| c.to_string()),
            message.error_code,
            message.error_message,
            ts(&message.created_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn write_attachment(conn: &Connection, attachment: &Attachment) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO chat_attachments (message_id, file_name, url, mime_type, size_bytes)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            attachment.message_id,
            attachment.file_name,
            attachment.url,
            attachment.mime_type,
            attachment.size_bytes,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Additive counter update; never read-modify-write
fn bump_session(
    conn: &Connection,
    session_id: i64,
    token_delta: Option<i64>,
    at: &DateTime<Utc>,
) -> Result<()> {
    let changed = conn.execute(
        r#"
        UPDATE chat_sessions
        SET message_count = message_count + 1,
            token_count = token_count + ?1,
            last_message_time = ?2
        WHERE id = ?3
        "#,
        params![token_delta.unwrap_or(0), ts(at), session_id],
    )?;
    if changed == 0 {
        return Err(Error::SessionNotFound(session_id));
    }
    Ok(())
}

fn write_usage(conn: &Connection, usage: &UsageRecord) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO usage_logs (request_id, session_id, user_id, provider, model, operation,
                                input_tokens, output_tokens, cost, currency, success, latency_ms,
                                error_message, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#,
        params![
            usage.request_id,
            usage.session_id,
            usage.user_id,
            usage.provider,
            usage.model,
            usage.operation.as_str(),
            usage.input_tokens,
            usage.output_tokens,
            usage.cost.map(|c| c.to_string()),
            usage.currency,
            usage.success,
            usage.latency_ms,
            usage.error_message,
            ts(&usage.created_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}
