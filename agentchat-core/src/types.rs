//! Core domain types for agentchat
//!
//! Two groups of types live here:
//!
//! - **Catalog profiles** ([`ProviderProfile`], [`ModelProfile`], [`PromptTemplate`],
//!   [`AgentProfile`]) are owned by the operator-facing configuration store and are
//!   read-only to the chat runtime.
//! - **Conversation records** ([`ChatSession`], [`ChatMessage`], [`Attachment`],
//!   [`UsageRecord`]) are written by the conversation orchestrator, one turn at a time.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Provider** | An LLM vendor endpoint (OpenAI, Anthropic, DashScope, ...) |
//! | **Model** | One callable model under a provider, with pricing and limits |
//! | **Agent** | A named bundle of model + prompt + generation parameters |
//! | **Descriptor** | The resolved snapshot of agent/model/provider/secret for one call |
//! | **Turn** | One user message in, one assistant message out |

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::segment::Segment;

// ============================================
// Catalog profiles
// ============================================

/// Immutable configuration for one model backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: i64,
    /// Provider code used for adapter selection ("openai", "qwen", ...)
    pub code: String,
    /// Human-friendly name
    #[serde(default)]
    pub name: Option<String>,
    /// Base URL override; the adapter default applies when absent
    #[serde(default)]
    pub base_url: Option<String>,
    /// Stored secret: a literal key or an `env:VAR` reference
    #[serde(default)]
    pub api_key: Option<String>,
    /// Requests per minute granted by the vendor (informational)
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,
    /// Disabled providers cannot be dispatched to
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// One callable model under a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    pub id: i64,
    /// Logical FK to [`ProviderProfile::id`]
    pub provider_id: i64,
    /// Vendor model identifier, e.g. "gpt-4o-mini"
    pub model_key: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub context_window: Option<u32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    /// Price per 1K input tokens
    #[serde(default)]
    pub input_price_per_1k: Option<Decimal>,
    /// Price per 1K output tokens
    #[serde(default)]
    pub output_price_per_1k: Option<Decimal>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub supports_structured_output: bool,
    /// Model-level default temperature
    #[serde(default)]
    pub default_temperature: Option<f32>,
    /// Model-level default top-p
    #[serde(default)]
    pub default_top_p: Option<f32>,
}

fn default_currency() -> String {
    "USD".to_string()
}

/// A system prompt template with `{{variable}}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: i64,
    pub name: String,
    pub content: String,
}

/// A named bundle of model, prompt and generation parameters.
///
/// Every generation parameter is optional. Absent values fall back to the
/// model defaults and then to whatever the backend does by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: i64,
    pub name: String,
    /// FK to [`ModelProfile::id`]
    pub model_id: i64,
    /// FK to [`PromptTemplate::id`]
    #[serde(default)]
    pub prompt_id: Option<i64>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Raw stored value: JSON array or comma-separated list
    #[serde(default)]
    pub stop_sequences: Option<String>,
    /// Raw stored value: JSON object or a literal such as "auto"
    #[serde(default)]
    pub tool_choice: Option<String>,
    /// Ordered tool references
    #[serde(default)]
    pub tool_ids: Vec<i64>,
    /// Ordered advisor references
    #[serde(default)]
    pub advisor_ids: Vec<i64>,
}

/// Read-only snapshot handed to the runtime for one call.
///
/// Built fresh by the descriptor assembler for every orchestration call and
/// never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ChatModelDescriptor {
    /// Who requested the call
    pub operator_id: i64,
    pub agent: AgentProfile,
    pub model: ModelProfile,
    pub provider: ProviderProfile,
    pub prompt: Option<PromptTemplate>,
    /// Secret after `env:` references have been resolved
    pub api_key: Option<String>,
}

impl ChatModelDescriptor {
    /// Provider code as stored (not normalized)
    pub fn provider_code(&self) -> &str {
        &self.provider.code
    }
}

// ============================================
// Sessions
// ============================================

/// A conversation between one user and one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: i64,
    pub user_id: i64,
    pub agent_id: i64,
    pub title: String,
    pub pinned: bool,
    pub archived: bool,
    /// Soft-delete flag; deleted sessions are never removed
    pub deleted: bool,
    pub message_count: i64,
    pub token_count: i64,
    pub last_message_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ============================================
// Messages
// ============================================

/// Role of the message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(MessageRole::System),
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "tool" => Ok(MessageRole::Tool),
            _ => Err(format!("unknown message role: {}", s)),
        }
    }
}

/// Kind of message within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Normal,
    Error,
    ToolCall,
    ToolResult,
    Event,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Normal => "NORMAL",
            MessageType::Error => "ERROR",
            MessageType::ToolCall => "TOOL_CALL",
            MessageType::ToolResult => "TOOL_RESULT",
            MessageType::Event => "EVENT",
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NORMAL" => Ok(MessageType::Normal),
            "ERROR" => Ok(MessageType::Error),
            "TOOL_CALL" => Ok(MessageType::ToolCall),
            "TOOL_RESULT" => Ok(MessageType::ToolResult),
            "EVENT" => Ok(MessageType::Event),
            _ => Err(format!("unknown message type: {}", s)),
        }
    }
}

/// Status flag stored with every message: 1 succeeded, 0 failed
pub const STATUS_OK: i32 = 1;
pub const STATUS_FAILED: i32 = 0;

/// One persisted chat message. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Database ID (auto-incremented, 0 before insert)
    pub id: i64,
    pub session_id: i64,
    /// Previous message in the session (None for the first)
    pub parent_id: Option<i64>,
    pub role: MessageRole,
    pub message_type: MessageType,
    /// Structured content
    pub segments: Vec<Segment>,
    /// Flattened text (reasoning excluded)
    pub content: Option<String>,
    pub status: i32,
    pub finish_reason: Option<String>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub latency_ms: Option<i64>,
    pub cost: Option<Decimal>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Attachments linked to this message (user messages only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl ChatMessage {
    /// Token delta this message adds to its session, if any
    pub fn token_delta(&self) -> Option<i64> {
        match (self.input_tokens, self.output_tokens) {
            (None, None) => None,
            (i, o) => Some(i64::from(i.unwrap_or(0)) + i64::from(o.unwrap_or(0))),
        }
    }

    pub fn is_error(&self) -> bool {
        self.message_type == MessageType::Error
    }
}

/// A file attached to a user message, stored as a sibling row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub message_id: i64,
    pub file_name: String,
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<i64>,
}

// ============================================
// Usage
// ============================================

/// What kind of model call produced a usage record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Chat,
    ChatStream,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Chat => "chat",
            OperationKind::ChatStream => "chat_stream",
        }
    }
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(OperationKind::Chat),
            "chat_stream" => Ok(OperationKind::ChatStream),
            _ => Err(format!("unknown operation kind: {}", s)),
        }
    }
}

/// Append-only record of one model invocation (success or failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    /// Database ID (0 before insert)
    pub id: i64,
    /// Unique per invocation
    pub request_id: String,
    pub session_id: i64,
    pub user_id: i64,
    pub provider: String,
    pub model: String,
    pub operation: OperationKind,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub cost: Option<Decimal>,
    pub currency: String,
    pub success: bool,
    pub latency_ms: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_round_trip() {
        for ty in [
            MessageType::Normal,
            MessageType::Error,
            MessageType::ToolCall,
            MessageType::ToolResult,
            MessageType::Event,
        ] {
            assert_eq!(ty.as_str().parse::<MessageType>().unwrap(), ty);
        }
        assert_eq!("error".parse::<MessageType>().unwrap(), MessageType::Error);
    }

    #[test]
    fn test_message_type_serializes_uppercase() {
        let json = serde_json::to_string(&MessageType::Error).unwrap();
        assert_eq!(json, "\"ERROR\"");
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("assistant".parse::<MessageRole>().unwrap(), MessageRole::Assistant);
        assert!("moderator".parse::<MessageRole>().is_err());
    }

    #[test]
    fn test_model_profile_defaults_from_toml() {
        let model: ModelProfile = toml::from_str(
            r#"
id = 3
provider_id = 1
model_key = "gpt-4o-mini"
max_output_tokens = 2048
input_price_per_1k = "0.00015"
"#,
        )
        .unwrap();
        assert_eq!(model.currency, "USD");
        assert_eq!(model.max_output_tokens, Some(2048));
        assert_eq!(model.input_price_per_1k, Some(Decimal::new(15, 5)));
        assert!(model.output_price_per_1k.is_none());
        assert!(!model.supports_tools);
    }
}
