//! Anthropic Messages API backend

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::sse::SseDecoder;
use super::{
    error_body, join_url, ChatModel, ChunkStream, GenerationOptions, ModelChunk, ModelResponse,
    PromptMessage, PromptRole, TokenUsage, ToolChoice,
};
use crate::error::{Error, Result};

const PROVIDER: &str = "anthropic";
const MESSAGES_PATH: &str = "v1/messages";
const API_VERSION: &str = "2023-06-01";

/// `max_tokens` is mandatory on this API
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub fn default_headers(api_key: Option<&str>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(key)
                .map_err(|e| Error::Config(format!("invalid API key header: {}", e)))?,
        );
    }
    headers.insert(
        HeaderName::from_static("anthropic-version"),
        HeaderValue::from_static(API_VERSION),
    );
    Ok(headers)
}

pub struct AnthropicChatModel {
    client: Client,
    messages_url: String,
}

impl AnthropicChatModel {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            messages_url: join_url(base_url, MESSAGES_PATH),
        }
    }

    fn build_request(
        &self,
        prompt: &[PromptMessage],
        options: &GenerationOptions,
        stream: bool,
    ) -> Value {
        let system: Vec<&str> = prompt
            .iter()
            .filter(|m| m.role == PromptRole::System)
            .map(|m| m.content.as_str())
            .collect();

        // The API requires strictly alternating roles
        let mut messages: Vec<(PromptRole, String)> = Vec::new();
        for message in prompt.iter().filter(|m| m.role != PromptRole::System) {
            match messages.last_mut() {
                Some((role, content)) if *role == message.role => {
                    content.push_str("\n\n");
                    content.push_str(&message.content);
                }
                _ => messages.push((message.role, message.content.clone())),
            }
        }

        let mut body = Map::new();
        body.insert("model".into(), json!(options.model));
        body.insert(
            "messages".into(),
            Value::Array(
                messages
                    .into_iter()
                    .map(|(role, content)| json!({"role": role.as_str(), "content": content}))
                    .collect(),
            ),
        );
        body.insert(
            "max_tokens".into(),
            json!(options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        );
        if !system.is_empty() {
            body.insert("system".into(), json!(system.join("\n\n")));
        }
        if let Some(t) = options.temperature {
            body.insert("temperature".into(), json!(t));
        }
        if let Some(p) = options.top_p {
            body.insert("top_p".into(), json!(p));
        }
        if !options.stop.is_empty() {
            body.insert("stop_sequences".into(), json!(options.stop));
        }
        if !options.tools.is_empty() {
            body.insert("tools".into(), Value::Array(options.tools.clone()));
            if let Some(choice) = &options.tool_choice {
                body.insert("tool_choice".into(), tool_choice_value(choice));
            }
        }
        if stream {
            body.insert("stream".into(), json!(true));
        }
        Value::Object(body)
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&self.messages_url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::invocation(PROVIDER, format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::invocation(PROVIDER, error_body(response).await));
        }
        Ok(response)
    }
}

/// Translate OpenAI-style literals to this API's object form
fn tool_choice_value(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Object(v) => v.clone(),
        ToolChoice::Literal(s) => match s.as_str() {
            "required" | "any" => json!({"type": "any"}),
            "none" => json!({"type": "none"}),
            _ => json!({"type": "auto"}),
        },
    }
}

// ============================================
// Wire types
// ============================================

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct UsagePayload {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

impl From<UsagePayload> for TokenUsage {
    fn from(usage: UsagePayload) -> Self {
        TokenUsage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockDelta {
        delta: BlockDelta,
    },
    MessageDelta {
        #[serde(default)]
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<UsagePayload>,
    },
    MessageStop,
    Error {
        error: ErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

enum Decoded {
    Chunk(ModelChunk),
    Stop,
    Skip,
}

fn decode_event(data: &str) -> Result<Decoded> {
    let event: StreamEvent = serde_json::from_str(data)
        .map_err(|e| Error::invocation(PROVIDER, format!("malformed stream payload: {}", e)))?;

    Ok(match event {
        StreamEvent::MessageStart { message } => {
            if message.id.is_none() && message.usage.is_none() {
                return Ok(Decoded::Skip);
            }
            let mut metadata = Map::new();
            if let Some(id) = message.id {
                metadata.insert("response_id".into(), json!(id));
            }
            Decoded::Chunk(ModelChunk {
                usage: message.usage.map(TokenUsage::from),
                metadata,
                ..Default::default()
            })
        }
        StreamEvent::ContentBlockDelta { delta } => match delta {
            BlockDelta::TextDelta { text } if !text.is_empty() => {
                Decoded::Chunk(ModelChunk::text(text))
            }
            BlockDelta::ThinkingDelta { thinking } if !thinking.is_empty() => {
                Decoded::Chunk(ModelChunk::reasoning(thinking))
            }
            _ => Decoded::Skip,
        },
        StreamEvent::MessageDelta { delta, usage } => Decoded::Chunk(ModelChunk {
            finish_reason: delta.stop_reason,
            usage: usage.map(TokenUsage::from),
            ..Default::default()
        }),
        StreamEvent::MessageStop => Decoded::Stop,
        StreamEvent::Error { error } => return Err(Error::invocation(PROVIDER, error.message)),
        StreamEvent::Other => Decoded::Skip,
    })
}

#[async_trait]
impl ChatModel for AnthropicChatModel {
    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn invoke(
        &self,
        prompt: &[PromptMessage],
        options: &GenerationOptions,
    ) -> Result<ModelResponse> {
        let body = self.build_request(prompt, options, false);
        let response = self.post(&body).await?;

        let raw = response
            .text()
            .await
            .map_err(|e| Error::invocation(PROVIDER, format!("failed to read response: {}", e)))?;
        let parsed: MessagesResponse = serde_json::from_str(&raw)
            .map_err(|e| Error::invocation(PROVIDER, format!("malformed response: {}", e)))?;

        let mut text = String::new();
        let mut thinking = String::new();
        for block in parsed.content {
            match block {
                ContentBlock::Text { text: t } => text.push_str(&t),
                ContentBlock::Thinking { thinking: t } => thinking.push_str(&t),
                ContentBlock::Other => {}
            }
        }

        let mut metadata = Map::new();
        if let Some(id) = parsed.id {
            metadata.insert("response_id".into(), json!(id));
        }
        if !thinking.is_empty() {
            metadata.insert("thinking".into(), json!(thinking));
        }

        Ok(ModelResponse {
            text,
            finish_reason: parsed.stop_reason,
            usage: parsed.usage.map(TokenUsage::from).unwrap_or_default(),
            metadata,
        })
    }

    async fn invoke_stream(
        &self,
        prompt: Vec<PromptMessage>,
        options: GenerationOptions,
    ) -> Result<ChunkStream> {
        let body = self.build_request(&prompt, &options, true);
        let response = self.post(&body).await?;

        let stream: ChunkStream = Box::pin(try_stream! {
            let mut bytes = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut stopped = false;

            while let Some(next) = bytes.next().await {
                let next = next.map_err(|e| {
                    Error::invocation(PROVIDER, format!("stream interrupted: {}", e))
                })?;
                for event in decoder.feed(&next) {
                    match decode_event(&event.data)? {
                        Decoded::Chunk(chunk) => {
                            yield chunk;
                        }
                        Decoded::Stop => {
                            stopped = true;
                            break;
                        }
                        Decoded::Skip => {}
                    }
                }
                if stopped {
                    break;
                }
            }
        });

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn model(server: &MockServer) -> AnthropicChatModel {
        let client = Client::builder()
            .default_headers(default_headers(Some("test-key")).unwrap())
            .build()
            .unwrap();
        AnthropicChatModel::new(client, &server.uri())
    }

    fn options() -> GenerationOptions {
        GenerationOptions {
            model: "claude-3-5-haiku-latest".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_request_shape() {
        let m = AnthropicChatModel::new(Client::new(), "https://api.anthropic.com");
        let prompt = vec![
            PromptMessage::system("You are terse."),
            PromptMessage::user("one"),
            PromptMessage::user("two"),
            PromptMessage::assistant("ok"),
        ];
        let mut opts = options();
        opts.stop = vec!["###".into()];
        opts.presence_penalty = Some(1.0);
        opts.tool_choice = Some(ToolChoice::Literal("required".into()));

        let body = m.build_request(&prompt, &opts, false);
        assert!(body.get("tool_choice").is_none());
        assert_eq!(body["system"], json!("You are terse."));
        assert_eq!(body["max_tokens"], json!(4096));
        assert_eq!(body["stop_sequences"], json!(["###"]));
        assert!(body.get("presence_penalty").is_none());
        assert_eq!(
            body["messages"],
            json!([
                {"role": "user", "content": "one\n\ntwo"},
                {"role": "assistant", "content": "ok"}
            ])
        );
    }

    #[test]
    fn test_tool_choice_literals() {
        assert_eq!(
            tool_choice_value(&ToolChoice::Literal("required".into())),
            json!({"type": "any"})
        );
        assert_eq!(
            tool_choice_value(&ToolChoice::Literal("auto".into())),
            json!({"type": "auto"})
        );
    }

    #[tokio::test]
    async fn test_invoke_collects_thinking() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "content": [
                    {"type": "thinking", "thinking": "2+2=4", "signature": "x"},
                    {"type": "text", "text": "4"}
                ],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 10, "output_tokens": 3}
            })))
            .mount(&server)
            .await;

        let response = model(&server)
            .invoke(&[PromptMessage::user("2+2?")], &options())
            .await
            .unwrap();
        assert_eq!(response.text, "4");
        assert_eq!(response.metadata["thinking"], json!("2+2=4"));
        assert_eq!(response.finish_reason.as_deref(), Some("end_turn"));
        assert_eq!(response.usage, TokenUsage::new(10, 3));
    }

    #[tokio::test]
    async fn test_stream_events() {
        let server = MockServer::start().await;
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"usage\":{\"input_tokens\":10,\"output_tokens\":1}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"hmm\"}}\n\n",
            "event: ping\n",
            "data: {\"type\":\"ping\"}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"text_delta\",\"text\":\"4\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":3}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n"
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(body)
                    .insert_header("content-type", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let mut stream = model(&server)
            .invoke_stream(vec![PromptMessage::user("2+2?")], options())
            .await
            .unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.unwrap());
        }

        let usage = chunks
            .iter()
            .filter_map(|c| c.usage)
            .fold(TokenUsage::default(), TokenUsage::merge);
        assert_eq!(usage, TokenUsage::new(10, 3));
        assert!(chunks.iter().any(|c| c.text == "hmm" && c.metadata.contains_key("reasoning_content")));
        assert!(chunks.iter().any(|c| c.text == "4" && c.metadata.is_empty()));
        assert_eq!(chunks[0].metadata.get("response_id"), Some(&json!("msg_1")));
        assert!(chunks[0].text.is_empty());
    }

    #[tokio::test]
    async fn test_stream_error_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n")
                    .insert_header("content-type", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let mut stream = model(&server)
            .invoke_stream(vec![PromptMessage::user("hi")], options())
            .await
            .unwrap();
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("Overloaded"));
    }
}
