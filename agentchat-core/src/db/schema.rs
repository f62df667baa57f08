//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: catalog profiles and conversation records
    r#"
    -- ============================================
    -- Catalog (operator-owned, read by the runtime)
    -- ============================================

    CREATE TABLE IF NOT EXISTS providers (
        id               INTEGER PRIMARY KEY,
        code             TEXT NOT NULL,
        name             TEXT,
        base_url         TEXT,
        api_key          TEXT,              -- literal secret or env:VAR
        rate_limit_rpm   INTEGER,
        enabled          INTEGER NOT NULL DEFAULT 1
    );

    -- provider_id is a logical reference only
    CREATE TABLE IF NOT EXISTS models (
        id                          INTEGER PRIMARY KEY,
        provider_id                 INTEGER NOT NULL,
        model_key                   TEXT NOT NULL,
        display_name                TEXT,
        context_window              INTEGER,
        max_output_tokens           INTEGER,
        input_price_per_1k          TEXT,   -- decimal as text
        output_price_per_1k         TEXT,
        currency                    TEXT NOT NULL DEFAULT 'USD',
        supports_tools              INTEGER NOT NULL DEFAULT 0,
        supports_vision             INTEGER NOT NULL DEFAULT 0,
        supports_structured_output  INTEGER NOT NULL DEFAULT 0,
        default_temperature         REAL,
        default_top_p               REAL
    );

    CREATE TABLE IF NOT EXISTS prompts (
        id               INTEGER PRIMARY KEY,
        name             TEXT NOT NULL,
        content          TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS agents (
        id                  INTEGER PRIMARY KEY,
        name                TEXT NOT NULL,
        model_id            INTEGER NOT NULL,
        prompt_id           INTEGER,
        temperature         REAL,
        top_p               REAL,
        presence_penalty    REAL,
        frequency_penalty   REAL,
        max_tokens          INTEGER,
        stop_sequences      TEXT,           -- raw: JSON array or comma list
        tool_choice         TEXT            -- raw: JSON object or literal
    );

    CREATE TABLE IF NOT EXISTS agent_tools (
        agent_id         INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
        position         INTEGER NOT NULL,
        tool_id          INTEGER NOT NULL,
        PRIMARY KEY (agent_id, position)
    );

    CREATE TABLE IF NOT EXISTS agent_advisors (
        agent_id         INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
        position         INTEGER NOT NULL,
        advisor_id       INTEGER NOT NULL,
        PRIMARY KEY (agent_id, position)
    );

    -- ============================================
    -- Conversations (written by the orchestrator)
    -- ============================================

    CREATE TABLE IF NOT EXISTS chat_sessions (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id             INTEGER NOT NULL,
        agent_id            INTEGER NOT NULL,
        title               TEXT NOT NULL,
        pinned              INTEGER NOT NULL DEFAULT 0,
        archived            INTEGER NOT NULL DEFAULT 0,
        deleted             INTEGER NOT NULL DEFAULT 0,
        message_count       INTEGER NOT NULL DEFAULT 0,
        token_count         INTEGER NOT NULL DEFAULT 0,
        last_message_time   DATETIME,
        created_at          DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_chat_sessions_user ON chat_sessions(user_id, deleted);

    CREATE TABLE IF NOT EXISTS chat_messages (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id       INTEGER NOT NULL REFERENCES chat_sessions(id),
        parent_id        INTEGER,
        role             TEXT NOT NULL,
        message_type     TEXT NOT NULL,
        segments         JSON NOT NULL,
        content          TEXT,
        status           INTEGER NOT NULL,
        finish_reason    TEXT,
        input_tokens     INTEGER,
        output_tokens    INTEGER,
        latency_ms       INTEGER,
        cost             TEXT,
        error_code       TEXT,
        error_message    TEXT,
        created_at       DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages(session_id, created_at, id);

    CREATE TABLE IF NOT EXISTS chat_attachments (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id       INTEGER NOT NULL REFERENCES chat_messages(id),
        file_name        TEXT NOT NULL,
        url              TEXT NOT NULL,
        mime_type        TEXT,
        size_bytes       INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_chat_attachments_message ON chat_attachments(message_id);

    -- Append-only, one row per model invocation
    CREATE TABLE IF NOT EXISTS usage_logs (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        request_id       TEXT NOT NULL UNIQUE,
        session_id       INTEGER NOT NULL,
        user_id          INTEGER NOT NULL,
        provider         TEXT NOT NULL,
        model            TEXT NOT NULL,
        operation        TEXT NOT NULL,
        input_tokens     INTEGER,
        output_tokens    INTEGER,
        cost             TEXT,
        currency         TEXT NOT NULL,
        success          INTEGER NOT NULL,
        latency_ms       INTEGER NOT NULL,
        error_message    TEXT,
        created_at       DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_usage_logs_session ON usage_logs(session_id);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
