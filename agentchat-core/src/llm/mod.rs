//! Model backend capability
//!
//! Every concrete backend implements [`ChatModel`]: one blocking call that
//! returns a complete [`ModelResponse`], and one streaming call that yields
//! [`ModelChunk`]s. Both operate on a normalized prompt ([`PromptMessage`])
//! and normalized options ([`GenerationOptions`]) so the orchestrator never
//! sees a vendor wire format.

pub mod anthropic;
pub mod openai;
pub mod pool;
mod sse;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

pub use anthropic::AnthropicChatModel;
pub use openai::{OpenAiChatModel, OpenAiDialect};
pub use pool::{ClientPool, PoolKey};

/// Role of a prompt message sent to a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

impl PromptRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptRole::System => "system",
            PromptRole::User => "user",
            PromptRole::Assistant => "assistant",
        }
    }
}

/// One message of the prompt handed to a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::Assistant,
            content: content.into(),
        }
    }
}

/// Tool-choice value: an opaque literal ("auto", "none", ...) or a JSON object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Literal(String),
    Object(Value),
}

/// Effective generation options for one call.
///
/// `None` fields are omitted from the request so the backend default applies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOptions {
    /// Vendor model key
    pub model: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop: Vec<String>,
    pub tool_choice: Option<ToolChoice>,
    /// Tool definitions in the backend's function-calling shape
    pub tools: Vec<Value>,
}

/// Token counts reported by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens: Some(input_tokens),
            output_tokens: Some(output_tokens),
        }
    }

    /// Sum of both sides, saturating on absurd backend reports
    pub fn total(&self) -> u32 {
        self.input_tokens
            .unwrap_or(0)
            .saturating_add(self.output_tokens.unwrap_or(0))
    }

    /// Keep whichever side each report actually carries.
    pub fn merge(self, later: TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: later.input_tokens.or(self.input_tokens),
            output_tokens: later.output_tokens.or(self.output_tokens),
        }
    }
}

/// Complete result of a blocking call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub finish_reason: Option<String>,
    pub usage: TokenUsage,
    /// Provider extras; reasoning text arrives under an allow-listed key
    pub metadata: Map<String, Value>,
}

/// One incremental piece of a streaming call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelChunk {
    pub text: String,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
    pub metadata: Map<String, Value>,
}

impl ModelChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// A reasoning delta, tagged under `reasoning_content`
    pub fn reasoning(text: impl Into<String>) -> Self {
        let text = text.into();
        let mut metadata = Map::new();
        metadata.insert("reasoning_content".to_string(), Value::String(text.clone()));
        Self {
            text,
            metadata,
            ..Default::default()
        }
    }
}

pub type ChunkStream = BoxStream<'static, Result<ModelChunk>>;

/// A callable model handle produced by the provider dispatcher.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Normalized provider code, used for usage records and errors
    fn provider(&self) -> &str;

    /// Blocking call returning the complete response
    async fn invoke(
        &self,
        prompt: &[PromptMessage],
        options: &GenerationOptions,
    ) -> Result<ModelResponse>;

    /// Streaming call; the returned stream is `'static` so it can move into a task
    async fn invoke_stream(
        &self,
        prompt: Vec<PromptMessage>,
        options: GenerationOptions,
    ) -> Result<ChunkStream>;
}

/// Join a base URL and a path without doubling or dropping slashes
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Summarize a non-success HTTP response for an invocation error
pub(crate) async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let body = body.trim();
    if body.is_empty() {
        format!("status {}", status)
    } else {
        let snippet: String = body.chars().take(500).collect();
        format!("status {}: {}", status, snippet)
    }
}
