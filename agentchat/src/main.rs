//! agentchat - multi-provider agent chat runtime
//!
//! Command line front end for the conversation runtime:
//! - Importing a catalog of providers, models, prompts and agents
//! - Running synchronous or streaming chat turns
//! - Listing, inspecting, pinning and deleting sessions
//! - Reporting per-session usage and cost
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/agentchat/agentchat.db
//! - Config: $XDG_CONFIG_HOME/agentchat/config.toml
//! - Logs: $XDG_STATE_HOME/agentchat/agentchat.log

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agentchat_core::{
    Catalog, ChatOrchestrator, Config, Database, ProviderDispatcher, SendRequest, StreamEvent,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "agentchat")]
#[command(about = "Chat with configured agents across model providers")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import providers, models, prompts and agents from a TOML catalog
    Import {
        /// Path to the catalog file
        path: PathBuf,
    },

    /// Send one message and print the reply
    Chat {
        /// Agent to talk to (ignored when continuing a session)
        #[arg(short, long)]
        agent: i64,

        /// Calling user
        #[arg(short, long)]
        user: i64,

        /// Continue an existing session
        #[arg(short, long)]
        session: Option<i64>,

        /// Stream the reply as JSON events, one per line
        #[arg(long)]
        stream: bool,

        /// Message text
        message: String,
    },

    /// List a user's sessions, pinned first
    Sessions {
        #[arg(short, long)]
        user: i64,
    },

    /// Print a session's messages in order
    History {
        #[arg(short, long)]
        session: i64,

        #[arg(short, long)]
        user: i64,
    },

    /// Pin or unpin a session
    Pin {
        #[arg(short, long)]
        session: i64,

        #[arg(short, long)]
        user: i64,

        /// Remove the pin instead of setting it
        #[arg(long)]
        off: bool,
    },

    /// Soft-delete a session
    Delete {
        #[arg(short, long)]
        session: i64,

        #[arg(short, long)]
        user: i64,
    },

    /// Show token and cost totals for a session
    Usage {
        #[arg(short, long)]
        session: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging (to file, stdout carries command output)
    let _log_guard =
        agentchat_core::logging::init(&config.logging).context("failed to initialize logging")?;

    // Open database
    let db_path = Config::database_path();
    tracing::debug!(path = %db_path.display(), "Opening database");

    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    let db = Arc::new(db);

    match args.command {
        Command::Import { path } => cmd_import(&db, &path),
        Command::Chat {
            agent,
            user,
            session,
            stream,
            message,
        } => {
            let request = SendRequest {
                user_id: user,
                agent_id: agent,
                session_id: session,
                content: message,
                attachments: vec![],
            };
            let chat = Arc::new(ChatOrchestrator::new(
                db,
                ProviderDispatcher::new(&config),
                &config,
            ));
            if stream {
                cmd_chat_stream(&chat, request).await
            } else {
                cmd_chat(&chat, request).await
            }
        }
        Command::Sessions { user } => cmd_sessions(&db, user),
        Command::History { session, user } => cmd_history(&db, session, user),
        Command::Pin { session, user, off } => cmd_pin(&db, session, user, !off),
        Command::Delete { session, user } => cmd_delete(&db, session, user),
        Command::Usage { session } => cmd_usage(&db, session),
    }
}

fn cmd_import(db: &Database, path: &Path) -> Result<()> {
    let catalog = Catalog::load(path)
        .with_context(|| format!("failed to load catalog {}", path.display()))?;
    let summary = db
        .import_catalog(&catalog)
        .context("failed to import catalog")?;

    println!("Import complete:");
    println!("  Providers: {}", summary.providers);
    println!("  Models:    {}", summary.models);
    println!("  Prompts:   {}", summary.prompts);
    println!("  Agents:    {}", summary.agents);
    Ok(())
}

async fn cmd_chat(chat: &ChatOrchestrator, request: SendRequest) -> Result<()> {
    let turn = chat.send(request).await.context("chat turn failed")?;
    let message = &turn.assistant_message;

    println!(
        "Session {}{}",
        turn.session.id,
        if turn.new_session { " (new)" } else { "" }
    );
    if message.is_error() {
        println!(
            "Error: {}",
            message.error_message.as_deref().unwrap_or("model invocation failed")
        );
    } else {
        for segment in message.segments.iter().filter(|s| s.kind.is_reasoning()) {
            println!("[reasoning] {}", segment.text);
        }
        println!("{}", message.content.as_deref().unwrap_or(""));
    }
    println!(
        "Tokens: {} in / {} out, {} ms",
        turn.usage.input_tokens.unwrap_or(0),
        turn.usage.output_tokens.unwrap_or(0),
        turn.usage.latency_ms
    );
    Ok(())
}

async fn cmd_chat_stream(chat: &Arc<ChatOrchestrator>, request: SendRequest) -> Result<()> {
    let mut events = chat
        .send_stream(request)
        .await
        .context("chat turn failed")?;

    while let Some(event) = events.recv().await {
        let line = serde_json::to_string(&event).context("failed to encode event")?;
        println!("{}", line);
        if event.is_terminal() {
            if let StreamEvent::Error { error, .. } = &event {
                tracing::warn!(error = %error, "Streaming turn ended with an error");
            }
            break;
        }
    }
    Ok(())
}

fn cmd_sessions(db: &Database, user: i64) -> Result<()> {
    let sessions = db
        .list_user_sessions(user)
        .context("failed to list sessions")?;

    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }

    for session in sessions {
        let last = session
            .last_message_time
            .unwrap_or(session.created_at)
            .format("%Y-%m-%d %H:%M");
        println!(
            "{:>6} {} {:<30} agent={} messages={} tokens={} last={}",
            session.id,
            if session.pinned { "*" } else { " " },
            session.title,
            session.agent_id,
            session.message_count,
            session.token_count,
            last
        );
    }
    Ok(())
}

fn cmd_history(db: &Database, session_id: i64, user: i64) -> Result<()> {
    db.find_user_session(session_id, user)
        .context("failed to load session")?
        .with_context(|| format!("session {} not found", session_id))?;

    let messages = db
        .session_messages(session_id)
        .context("failed to load messages")?;

    for message in messages {
        let label = if message.is_error() {
            format!("{}:{}", message.role.as_str(), message.message_type.as_str())
        } else {
            message.role.as_str().to_string()
        };
        println!(
            "[{}] {}",
            label,
            message
                .content
                .as_deref()
                .or(message.error_message.as_deref())
                .unwrap_or("")
        );
        for attachment in &message.attachments {
            println!("    attachment: {} ({})", attachment.file_name, attachment.url);
        }
    }
    Ok(())
}

fn cmd_pin(db: &Database, session_id: i64, user: i64, pinned: bool) -> Result<()> {
    if !db
        .set_session_pinned(session_id, user, pinned)
        .context("failed to update session")?
    {
        anyhow::bail!("session {} not found", session_id);
    }
    println!(
        "Session {} {}",
        session_id,
        if pinned { "pinned" } else { "unpinned" }
    );
    Ok(())
}

fn cmd_delete(db: &Database, session_id: i64, user: i64) -> Result<()> {
    if !db
        .soft_delete_session(session_id, user)
        .context("failed to delete session")?
    {
        anyhow::bail!("session {} not found", session_id);
    }
    println!("Session {} deleted", session_id);
    Ok(())
}

fn cmd_usage(db: &Database, session_id: i64) -> Result<()> {
    let summary = db
        .usage_summary(session_id)
        .context("failed to load usage")?;
    let currency = db
        .usage_for_session(session_id)
        .context("failed to load usage")?
        .first()
        .map(|r| r.currency.clone())
        .unwrap_or_else(|| "USD".to_string());

    println!("Usage for session {}", session_id);
    println!("  Calls:         {}", summary.calls);
    println!("  Failures:      {}", summary.failures);
    println!("  Input tokens:  {}", summary.input_tokens);
    println!("  Output tokens: {}", summary.output_tokens);
    println!("  Cost:          {} {}", summary.cost.normalize(), currency);
    Ok(())
}
