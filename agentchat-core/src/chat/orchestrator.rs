//! Conversation orchestration
//!
//! One turn is: prepare the session, persist the user message, build the
//! prompt, invoke the model, then persist the assistant message together
//! with the session counters and a usage record.
//!
//! Configuration and reference problems (unknown agent, unsupported provider,
//! missing key, foreign session) abort the turn before anything is written.
//! Backend failures never abort: they become an assistant message of type
//! `ERROR` and a usage record with `success = false`.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::OwnedMutexGuard;

use super::events::StreamEvent;
use super::locks::SessionLocks;
use crate::config::{ChatConfig, Config};
use crate::db::Database;
use crate::descriptor::DescriptorAssembler;
use crate::dispatch::{ProviderDispatcher, RuntimeContext};
use crate::error::{Error, Result};
use crate::llm::{ModelResponse, PromptMessage, TokenUsage};
use crate::prompt::PromptAssembler;
use crate::segment::{self, Segment, SegmentType, StreamAccumulator};
use crate::types::*;
use crate::usage::UsageContext;

/// Error code stored on messages produced by a failed backend call
pub const MODEL_INVOCATION_ERROR: &str = "MODEL_INVOCATION";

/// Input for one turn
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    /// Caller; owns the session
    pub user_id: i64,
    /// Agent for a new session. Existing sessions keep their own agent.
    pub agent_id: i64,
    pub session_id: Option<i64>,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

/// Outcome of a synchronous turn
#[derive(Debug, Clone)]
pub struct TurnResult {
    /// Session with counters as of the end of the turn
    pub session: ChatSession,
    pub new_session: bool,
    pub user_message: ChatMessage,
    pub assistant_message: ChatMessage,
    pub usage: UsageRecord,
}

/// State carried from preparation into invocation
struct PreparedTurn {
    session: ChatSession,
    new_session: bool,
    runtime: RuntimeContext,
    user_message: ChatMessage,
    prompt: Vec<PromptMessage>,
    _guard: OwnedMutexGuard<()>,
}

impl PreparedTurn {
    fn usage_context(&self, operation: OperationKind) -> UsageContext<'_> {
        UsageContext {
            session_id: self.session.id,
            user_id: self.session.user_id,
            provider: self.runtime.model.provider(),
            model: &self.runtime.descriptor.model,
            operation,
        }
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    (started.elapsed().as_millis() as i64).max(1)
}

pub struct ChatOrchestrator {
    db: Arc<Database>,
    descriptors: DescriptorAssembler,
    dispatcher: ProviderDispatcher,
    prompts: PromptAssembler,
    chat: ChatConfig,
    locks: SessionLocks,
}

impl ChatOrchestrator {
    pub fn new(db: Arc<Database>, dispatcher: ProviderDispatcher, config: &Config) -> Self {
        Self {
            descriptors: DescriptorAssembler::new(db.clone()),
            db,
            dispatcher,
            prompts: PromptAssembler::new(config.chat.history_window),
            chat: config.chat.clone(),
            locks: SessionLocks::new(),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn dispatcher(&self) -> &ProviderDispatcher {
        &self.dispatcher
    }

    /// Title for a new session: the start of the first message, or the placeholder
    pub fn session_title(&self, content: &str) -> String {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            self.chat.default_title.clone()
        } else {
            trimmed.chars().take(self.chat.title_max_chars).collect()
        }
    }

    // ============================================
    // Shared preparation
    // ============================================

    async fn prepare(&self, req: &SendRequest) -> Result<PreparedTurn> {
        let (existing, guard) = match req.session_id {
            Some(id) => {
                let guard = self.locks.acquire(id).await;
                let session = self
                    .db
                    .find_user_session(id, req.user_id)?
                    .ok_or(Error::SessionNotFound(id))?;
                (Some(session), Some(guard))
            }
            None => (None, None),
        };

        let agent_id = existing.as_ref().map_or(req.agent_id, |s| s.agent_id);
        let descriptor = Arc::new(self.descriptors.assemble(agent_id, req.user_id)?);
        let runtime = self.dispatcher.select(descriptor)?;

        let (session, new_session, guard) = match (existing, guard) {
            (Some(session), Some(guard)) => (session, false, guard),
            _ => {
                let session = self.db.create_session(
                    req.user_id,
                    agent_id,
                    &self.session_title(&req.content),
                )?;
                tracing::info!(
                    session_id = session.id,
                    user_id = req.user_id,
                    agent_id,
                    "Created chat session"
                );
                let guard = self.locks.acquire(session.id).await;
                (session, true, guard)
            }
        };

        let segments = vec![Segment::text(req.content.clone())];
        let user_message = ChatMessage {
            id: 0,
            session_id: session.id,
            parent_id: self.db.last_message_id(session.id)?,
            role: MessageRole::User,
            message_type: MessageType::Normal,
            content: Some(segment::flatten_for_prompt(&segments)),
            segments,
            status: STATUS_OK,
            finish_reason: None,
            input_tokens: None,
            output_tokens: None,
            latency_ms: None,
            cost: None,
            error_code: None,
            error_message: None,
            created_at: Utc::now(),
            attachments: req.attachments.clone(),
        };
        let user_message = self.db.insert_user_message(&user_message)?;

        let history = self
            .db
            .recent_messages(session.id, self.prompts.window())?;
        let prompt = self.prompts.build(&runtime.descriptor, history);

        tracing::debug!(
            session_id = session.id,
            provider = %runtime.model.provider(),
            model = %runtime.options.model,
            prompt_messages = prompt.len(),
            "Prepared turn"
        );

        Ok(PreparedTurn {
            session,
            new_session,
            runtime,
            user_message,
            prompt,
            _guard: guard,
        })
    }

    fn assistant_message(turn: &PreparedTurn, segments: Vec<Segment>, latency_ms: i64) -> ChatMessage {
        let content = segment::flatten_for_prompt(&segments);
        ChatMessage {
            id: 0,
            session_id: turn.session.id,
            parent_id: Some(turn.user_message.id),
            role: MessageRole::Assistant,
            message_type: MessageType::Normal,
            content: if content.is_empty() { None } else { Some(content) },
            segments,
            status: STATUS_OK,
            finish_reason: None,
            input_tokens: None,
            output_tokens: None,
            latency_ms: Some(latency_ms),
            cost: None,
            error_code: None,
            error_message: None,
            created_at: Utc::now(),
            attachments: vec![],
        }
    }

    fn error_message(
        turn: &PreparedTurn,
        mut segments: Vec<Segment>,
        error: &str,
        latency_ms: i64,
    ) -> ChatMessage {
        segments.push(Segment::error(error));
        let mut message = Self::assistant_message(turn, segments, latency_ms);
        message.message_type = MessageType::Error;
        message.status = STATUS_FAILED;
        message.error_code = Some(MODEL_INVOCATION_ERROR.to_string());
        message.error_message = Some(error.to_string());
        message
    }

    fn success_message(
        turn: &PreparedTurn,
        segments: Vec<Segment>,
        finish_reason: Option<String>,
        usage: &UsageRecord,
    ) -> ChatMessage {
        let mut message = Self::assistant_message(turn, segments, usage.latency_ms);
        message.finish_reason = finish_reason;
        message.input_tokens = usage.input_tokens;
        message.output_tokens = usage.output_tokens;
        message.cost = usage.cost;
        message
    }

    /// Reasoning from response metadata first, then the answer text
    fn response_segments(response: &ModelResponse) -> Vec<Segment> {
        let mut segments = segment::reasoning_segments(&response.metadata);
        if !response.text.is_empty() {
            segments.push(Segment::text(response.text.clone()));
        }
        segments
    }

    fn refreshed_session(&self, session: ChatSession) -> Result<ChatSession> {
        Ok(self.db.get_session(session.id)?.unwrap_or(session))
    }

    // ============================================
    // Synchronous turn
    // ============================================

    /// Run one turn and wait for the complete answer.
    pub async fn send(&self, req: SendRequest) -> Result<TurnResult> {
        let turn = self.prepare(&req).await?;
        let started = Instant::now();

        let outcome = turn
            .runtime
            .model
            .invoke(&turn.prompt, &turn.runtime.options)
            .await;
        let latency_ms = elapsed_ms(started);
        let usage_ctx = turn.usage_context(OperationKind::Chat);

        let (message, usage) = match outcome {
            Ok(response) => {
                let usage = usage_ctx.success(response.usage, latency_ms);
                let segments = Self::response_segments(&response);
                let message =
                    Self::success_message(&turn, segments, response.finish_reason, &usage);
                (message, usage)
            }
            Err(e) => {
                let summary = e.to_string();
                tracing::warn!(
                    session_id = turn.session.id,
                    provider = %turn.runtime.model.provider(),
                    latency_ms,
                    error = %summary,
                    "Model invocation failed"
                );
                let usage = usage_ctx.failure(latency_ms, &summary);
                (Self::error_message(&turn, vec![], &summary, latency_ms), usage)
            }
        };

        let (assistant_message, usage) = self.db.complete_turn(&message, &usage)?;

        tracing::info!(
            session_id = turn.session.id,
            success = usage.success,
            latency_ms = usage.latency_ms,
            input_tokens = ?usage.input_tokens,
            output_tokens = ?usage.output_tokens,
            "Turn complete"
        );

        let PreparedTurn {
            session,
            new_session,
            user_message,
            ..
        } = turn;

        Ok(TurnResult {
            session: self.refreshed_session(session)?,
            new_session,
            user_message,
            assistant_message,
            usage,
        })
    }

    // ============================================
    // Streaming turn
    // ============================================

    /// Start a streaming turn.
    ///
    /// Errors that abort before any write are returned directly. Otherwise
    /// the receiver yields a `session` event, zero or more `delta` events and
    /// one terminal event. The turn runs on its own task and is persisted
    /// even if the receiver is dropped.
    pub async fn send_stream(self: &Arc<Self>, req: SendRequest) -> Result<UnboundedReceiver<StreamEvent>> {
        let turn = self.prepare(&req).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        let _ = tx.send(StreamEvent::session(turn.session.id, turn.new_session));

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_stream(turn, tx).await;
        });

        Ok(rx)
    }

    async fn run_stream(&self, turn: PreparedTurn, tx: UnboundedSender<StreamEvent>) {
        let session_id = turn.session.id;
        let new_session = turn.new_session;

        let (acc, usage, finish_reason, failure) = self.consume_stream(&turn, &tx).await;
        let latency_ms = elapsed_ms(acc.started_at());
        let response_id = acc
            .metadata()
            .get("response_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let usage_ctx = turn.usage_context(OperationKind::ChatStream);

        let (message, record) = match &failure {
            None => {
                let record = usage_ctx.success(usage, latency_ms);
                let message = Self::success_message(&turn, acc.finish(), finish_reason, &record);
                (message, record)
            }
            Some(error) => {
                tracing::warn!(
                    session_id,
                    provider = %turn.runtime.model.provider(),
                    latency_ms,
                    buffered = acc.buffers().len(),
                    error = %error,
                    "Streaming invocation failed"
                );
                let record = usage_ctx.failure(latency_ms, error);
                (Self::error_message(&turn, acc.finish(), error, latency_ms), record)
            }
        };

        let event = match self.db.complete_turn(&message, &record) {
            Ok((message, record)) => {
                tracing::info!(
                    session_id,
                    success = record.success,
                    latency_ms = record.latency_ms,
                    response_id = response_id.as_deref().unwrap_or("-"),
                    "Streaming turn complete"
                );
                match failure {
                    None => StreamEvent::complete(session_id, new_session, message, usage),
                    Some(error) => StreamEvent::error(session_id, new_session, error, Some(message)),
                }
            }
            Err(e) => {
                tracing::error!(session_id, error = %e, "Failed to persist streaming turn");
                StreamEvent::error(session_id, new_session, e.to_string(), None)
            }
        };

        if tx.send(event).is_err() {
            tracing::debug!(session_id, "Stream receiver dropped before completion");
        }
    }

    /// Drain the backend stream into an accumulator, forwarding deltas.
    async fn consume_stream(
        &self,
        turn: &PreparedTurn,
        tx: &UnboundedSender<StreamEvent>,
    ) -> (StreamAccumulator, TokenUsage, Option<String>, Option<String>) {
        let session_id = turn.session.id;
        let mut acc = StreamAccumulator::new();
        let mut usage = TokenUsage::default();
        let mut finish_reason = None;

        let stream = turn
            .runtime
            .model
            .invoke_stream(turn.prompt.clone(), turn.runtime.options.clone())
            .await;
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => return (acc, usage, finish_reason, Some(e.to_string())),
        };

        while let Some(item) = stream.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => return (acc, usage, finish_reason, Some(e.to_string())),
            };

            if let Some(reported) = chunk.usage {
                usage = usage.merge(reported);
            }
            if chunk.finish_reason.is_some() {
                finish_reason = chunk.finish_reason.clone();
            }
            acc = acc.observe(&chunk.metadata);
            if chunk.text.is_empty() {
                continue;
            }

            let kind = if segment::is_reasoning_metadata(&chunk.metadata) {
                SegmentType::Reasoning
            } else {
                SegmentType::Text
            };
            // A closed receiver does not cancel the turn
            let _ = tx.send(StreamEvent::delta(session_id, chunk.text.clone(), kind.clone()));
            acc = acc.push(kind, &chunk.text);
        }

        (acc, usage, finish_reason, None)
    }
}
