//! OpenAI-compatible chat completions backend
//!
//! OpenAI, DashScope (Qwen), DeepSeek, Zhipu (GLM), Ollama and any generic
//! OpenAI-compatible gateway speak the same `/chat/completions` protocol.
//! The small differences between them are captured by [`OpenAiDialect`].

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::sse::SseDecoder;
use super::{
    error_body, join_url, ChatModel, ChunkStream, GenerationOptions, ModelChunk, ModelResponse,
    PromptMessage, TokenUsage, ToolChoice,
};
use crate::error::{Error, Result};

const CHAT_COMPLETIONS_PATH: &str = "chat/completions";

/// Per-vendor quirks of the OpenAI wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenAiDialect {
    /// Provider code reported in usage records and errors
    pub provider: &'static str,
    /// Whether `presence_penalty`/`frequency_penalty` are accepted
    pub penalties: bool,
    /// Whether `stream_options.include_usage` is accepted
    pub stream_usage: bool,
}

impl OpenAiDialect {
    pub const OPENAI: OpenAiDialect = OpenAiDialect {
        provider: "openai",
        penalties: true,
        stream_usage: true,
    };
    pub const DASHSCOPE: OpenAiDialect = OpenAiDialect {
        provider: "dashscope",
        penalties: true,
        stream_usage: true,
    };
    pub const DEEPSEEK: OpenAiDialect = OpenAiDialect {
        provider: "deepseek",
        penalties: true,
        stream_usage: true,
    };
    pub const ZHIPUAI: OpenAiDialect = OpenAiDialect {
        provider: "zhipuai",
        penalties: false,
        stream_usage: false,
    };
    pub const OLLAMA: OpenAiDialect = OpenAiDialect {
        provider: "ollama",
        penalties: true,
        stream_usage: true,
    };
    pub const COMPATIBLE: OpenAiDialect = OpenAiDialect {
        provider: "openai_compatible",
        penalties: true,
        stream_usage: false,
    };
}

/// Default headers for an OpenAI-compatible client
pub fn default_headers(api_key: Option<&str>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
        let value = HeaderValue::from_str(&format!("Bearer {}", key))
            .map_err(|e| Error::Config(format!("invalid API key header: {}", e)))?;
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

pub struct OpenAiChatModel {
    client: Client,
    chat_url: String,
    dialect: OpenAiDialect,
}

impl OpenAiChatModel {
    pub fn new(client: Client, base_url: &str, dialect: OpenAiDialect) -> Self {
        Self {
            client,
            chat_url: join_url(base_url, CHAT_COMPLETIONS_PATH),
            dialect,
        }
    }

    fn build_request(
        &self,
        prompt: &[PromptMessage],
        options: &GenerationOptions,
        stream: bool,
    ) -> Value {
        let messages: Vec<Value> = prompt
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = Map::new();
        body.insert("model".into(), json!(options.model));
        body.insert("messages".into(), Value::Array(messages));
        body.insert("stream".into(), json!(stream));

        if let Some(t) = options.temperature {
            body.insert("temperature".into(), json!(t));
        }
        if let Some(p) = options.top_p {
            body.insert("top_p".into(), json!(p));
        }
        if self.dialect.penalties {
            if let Some(p) = options.presence_penalty {
                body.insert("presence_penalty".into(), json!(p));
            }
            if let Some(p) = options.frequency_penalty {
                body.insert("frequency_penalty".into(), json!(p));
            }
        }
        if let Some(max) = options.max_tokens {
            body.insert("max_tokens".into(), json!(max));
        }
        if !options.stop.is_empty() {
            body.insert("stop".into(), json!(options.stop));
        }
        // tool_choice without tools is rejected by most vendors
        if !options.tools.is_empty() {
            body.insert("tools".into(), Value::Array(options.tools.clone()));
            if let Some(choice) = &options.tool_choice {
                let value = match choice {
                    ToolChoice::Literal(s) => json!(s),
                    ToolChoice::Object(v) => v.clone(),
                };
                body.insert("tool_choice".into(), value);
            }
        }
        if stream && self.dialect.stream_usage {
            body.insert("stream_options".into(), json!({"include_usage": true}));
        }

        Value::Object(body)
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let provider = self.dialect.provider;
        let response = self
            .client
            .post(&self.chat_url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::invocation(provider, format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::invocation(provider, error_body(response).await));
        }
        Ok(response)
    }
}

// ============================================
// Wire types
// ============================================

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: InboundMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct InboundMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
}

impl From<UsagePayload> for TokenUsage {
    fn from(usage: UsagePayload) -> Self {
        TokenUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    delta: InboundMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

/// Convert one decoded stream payload into chunks, reasoning before text.
fn payload_chunks(payload: StreamPayload) -> Vec<ModelChunk> {
    let mut chunks = Vec::new();
    let mut finish_reason = None;

    for choice in payload.choices.into_iter().filter(|c| c.index == 0) {
        let delta = choice.delta;
        if let Some(reasoning) = delta.reasoning_content.or(delta.reasoning) {
            if !reasoning.is_empty() {
                chunks.push(ModelChunk::reasoning(reasoning));
            }
        }
        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            chunks.push(ModelChunk::text(content));
        }
        if choice.finish_reason.is_some() {
            finish_reason = choice.finish_reason;
        }
    }

    let usage = payload.usage.map(TokenUsage::from);
    if finish_reason.is_some() || usage.is_some() {
        let mut metadata = Map::new();
        if let Some(id) = payload.id {
            metadata.insert("response_id".into(), json!(id));
        }
        chunks.push(ModelChunk {
            finish_reason,
            usage,
            metadata,
            ..Default::default()
        });
    }
    chunks
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn provider(&self) -> &str {
        self.dialect.provider
    }

    async fn invoke(
        &self,
        prompt: &[PromptMessage],
        options: &GenerationOptions,
    ) -> Result<ModelResponse> {
        let provider = self.dialect.provider;
        let body = self.build_request(prompt, options, false);
        let response = self.post(&body).await?;

        let raw = response
            .text()
            .await
            .map_err(|e| Error::invocation(provider, format!("failed to read response: {}", e)))?;
        let parsed: CompletionResponse = serde_json::from_str(&raw)
            .map_err(|e| Error::invocation(provider, format!("malformed response: {}", e)))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::invocation(provider, "response contained no choices"))?;

        let mut metadata = Map::new();
        if let Some(id) = parsed.id {
            metadata.insert("response_id".into(), json!(id));
        }
        let message = choice.message;
        if let Some(reasoning) = message.reasoning_content.or(message.reasoning) {
            metadata.insert("reasoning_content".into(), json!(reasoning));
        }

        Ok(ModelResponse {
            text: message.content.unwrap_or_default(),
            finish_reason: choice.finish_reason,
            usage: parsed.usage.map(TokenUsage::from).unwrap_or_default(),
            metadata,
        })
    }

    async fn invoke_stream(
        &self,
        prompt: Vec<PromptMessage>,
        options: GenerationOptions,
    ) -> Result<ChunkStream> {
        let provider = self.dialect.provider;
        let body = self.build_request(&prompt, &options, true);
        let response = self.post(&body).await?;

        let stream: ChunkStream = Box::pin(try_stream! {
            let mut bytes = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut done = false;

            while let Some(next) = bytes.next().await {
                let next = next.map_err(|e| {
                    Error::invocation(provider, format!("stream interrupted: {}", e))
                })?;
                for event in decoder.feed(&next) {
                    if event.is_done() {
                        done = true;
                        break;
                    }
                    let payload: StreamPayload = serde_json::from_str(&event.data).map_err(|e| {
                        Error::invocation(provider, format!("malformed stream payload: {}", e))
                    })?;
                    for chunk in payload_chunks(payload) {
                        yield chunk;
                    }
                }
                if done {
                    break;
                }
            }

            if !done {
                if let Some(event) = decoder.finish() {
                    if !event.is_done() {
                        if let Ok(payload) = serde_json::from_str::<StreamPayload>(&event.data) {
                            for chunk in payload_chunks(payload) {
                                yield chunk;
                            }
                        }
                    }
                }
            }
        });

        Ok(stream)
    }
}
