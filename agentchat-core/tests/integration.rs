//! End-to-end tests for conversation turns
//!
//! Turns run against an in-memory database seeded from a catalog document.
//! Backends are replaced with a scripted model through the dispatcher's
//! factory seam, except for the timeout test which drives the real HTTP
//! adapter against a mock server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentchat_core::chat::{ChatOrchestrator, SendRequest, StreamEvent, MODEL_INVOCATION_ERROR};
use agentchat_core::dispatch::{ConnectionParams, ModelFactory};
use agentchat_core::llm::{
    ChatModel, ChunkStream, GenerationOptions, ModelChunk, ModelResponse, PromptMessage,
    PromptRole, TokenUsage,
};
use agentchat_core::{
    Catalog, Config, Database, Error, MessageRole, MessageType, ProviderDispatcher, Result,
    SegmentType, STATUS_FAILED,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CATALOG: &str = r#"
[[providers]]
id = 1
code = "openai"
api_key = "sk-test"

[[providers]]
id = 2
code = "deepseek"

[[providers]]
id = 3
code = "bard"
api_key = "k"

[[models]]
id = 3
provider_id = 1
model_key = "gpt-4o-mini"
max_output_tokens = 2048
input_price_per_1k = "0.0015"
output_price_per_1k = "0.002"

[[models]]
id = 4
provider_id = 2
model_key = "deepseek-chat"

[[models]]
id = 5
provider_id = 3
model_key = "bard-1"

[[prompts]]
id = 2
name = "helper"
content = "You are {{agent_name}}."

[[agents]]
id = 7
name = "Helper"
model_id = 3
prompt_id = 2

[[agents]]
id = 8
name = "Keyless"
model_id = 4

[[agents]]
id = 9
name = "Unknown backend"
model_id = 5
"#;

// ============================================
// Scripted backend
// ============================================

/// What the scripted model does on its next call
#[derive(Clone)]
enum Script {
    Reply(ModelResponse),
    Fail(String),
    Stream(Vec<ModelChunk>),
    StreamFail(Vec<ModelChunk>, String),
}

struct ScriptedModel {
    script: Script,
    prompts: Mutex<Vec<Vec<PromptMessage>>>,
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn provider(&self) -> &str {
        "openai"
    }

    async fn invoke(&self, prompt: &[PromptMessage], _: &GenerationOptions) -> Result<ModelResponse> {
        self.prompts.lock().unwrap().push(prompt.to_vec());
        match &self.script {
            Script::Reply(response) => Ok(response.clone()),
            Script::Fail(message) => Err(Error::invocation("openai", message.clone())),
            _ => panic!("sync call on a streaming script"),
        }
    }

    async fn invoke_stream(&self, prompt: Vec<PromptMessage>, _: GenerationOptions) -> Result<ChunkStream> {
        self.prompts.lock().unwrap().push(prompt);
        let items: Vec<Result<ModelChunk>> = match &self.script {
            Script::Stream(chunks) => chunks.iter().cloned().map(Ok).collect(),
            Script::StreamFail(chunks, message) => chunks
                .iter()
                .cloned()
                .map(Ok)
                .chain(std::iter::once(Err(Error::invocation("openai", message.clone()))))
                .collect(),
            _ => panic!("streaming call on a sync script"),
        };
        Ok(Box::pin(futures_util::stream::iter(items)))
    }
}

struct ScriptedFactory {
    model: Arc<ScriptedModel>,
}

impl ModelFactory for ScriptedFactory {
    fn build(&self, _: &ConnectionParams) -> Result<Arc<dyn ChatModel>> {
        Ok(self.model.clone())
    }
}

struct Harness {
    db: Arc<Database>,
    chat: Arc<ChatOrchestrator>,
    model: Arc<ScriptedModel>,
}

fn harness(script: Script) -> Harness {
    agentchat_core::logging::init_test();

    let db = Arc::new(Database::open_in_memory().unwrap());
    db.migrate().unwrap();
    db.import_catalog(&Catalog::parse(CATALOG).unwrap()).unwrap();

    let model = Arc::new(ScriptedModel {
        script,
        prompts: Mutex::new(Vec::new()),
    });
    let config = Config::default();
    let dispatcher = ProviderDispatcher::with_factory(
        &config,
        Arc::new(ScriptedFactory {
            model: model.clone(),
        }),
    );
    let chat = Arc::new(ChatOrchestrator::new(db.clone(), dispatcher, &config));

    Harness { db, chat, model }
}

fn reply(text: &str, input: u32, output: u32) -> Script {
    Script::Reply(ModelResponse {
        text: text.into(),
        finish_reason: Some("stop".into()),
        usage: TokenUsage::new(input, output),
        metadata: Map::new(),
    })
}

fn request(user_id: i64, agent_id: i64, session_id: Option<i64>, content: &str) -> SendRequest {
    SendRequest {
        user_id,
        agent_id,
        session_id,
        content: content.into(),
        attachments: vec![],
    }
}

async fn collect(mut rx: UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

// ============================================
// Synchronous turns
// ============================================

#[tokio::test]
async fn test_first_message_creates_titled_session() {
    let h = harness(reply("Hi there", 12, 6));

    let turn = h.chat.send(request(1, 7, None, "Hello")).await.unwrap();

    assert!(turn.new_session);
    assert_eq!(turn.session.title, "Hello");
    assert_eq!(turn.session.agent_id, 7);
    assert_eq!(turn.session.message_count, 2);
    assert_eq!(turn.session.token_count, 18);
    assert!(turn.session.last_message_time.is_some());

    let messages = h.db.session_messages(turn.session.id).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].parent_id, Some(messages[0].id));
    assert_eq!(messages[1].content.as_deref(), Some("Hi there"));
    assert_eq!(messages[1].finish_reason.as_deref(), Some("stop"));

    // 12/1000 * 0.0015 + 6/1000 * 0.002
    assert_eq!(turn.usage.cost.unwrap().to_string(), "0.00003");
    assert_eq!(turn.assistant_message.cost, turn.usage.cost);
    assert!(turn.usage.success);
}

#[tokio::test]
async fn test_long_and_blank_titles() {
    let h = harness(reply("ok", 1, 1));

    let long = "abcdefghij".repeat(5);
    let turn = h.chat.send(request(1, 7, None, &long)).await.unwrap();
    assert_eq!(turn.session.title, &long[..30]);

    let turn = h.chat.send(request(1, 7, None, "   ")).await.unwrap();
    assert_eq!(turn.session.title, "New Chat");
}

#[tokio::test]
async fn test_counters_accumulate_over_turns() {
    let h = harness(reply("ok", 10, 5));

    let first = h.chat.send(request(1, 7, None, "one")).await.unwrap();
    let session_id = first.session.id;
    let mut last = first;
    for text in ["two", "three"] {
        last = h
            .chat
            .send(request(1, 7, Some(session_id), text))
            .await
            .unwrap();
        assert!(!last.new_session);
    }

    assert_eq!(last.session.message_count, 6);
    assert_eq!(last.session.token_count, 45);

    let summary = h.db.usage_summary(session_id).unwrap();
    assert_eq!(summary.calls, 3);
    assert_eq!(summary.failures, 0);
    assert_eq!(summary.input_tokens, 30);
    assert_eq!(summary.output_tokens, 15);

    // ids are monotonic and chained by parent
    let messages = h.db.session_messages(session_id).unwrap();
    for pair in messages.windows(2) {
        assert!(pair[0].id < pair[1].id);
        assert_eq!(pair[1].parent_id, Some(pair[0].id));
    }
}

#[tokio::test]
async fn test_prompt_carries_system_template_and_history() {
    let h = harness(reply("ok", 1, 1));

    let first = h.chat.send(request(1, 7, None, "one")).await.unwrap();
    h.chat
        .send(request(1, 7, Some(first.session.id), "two"))
        .await
        .unwrap();

    let prompts = h.model.prompts.lock().unwrap();
    let last = prompts.last().unwrap();
    let shape: Vec<_> = last.iter().map(|m| (m.role, m.content.as_str())).collect();
    assert_eq!(
        shape,
        vec![
            (PromptRole::System, "You are Helper."),
            (PromptRole::User, "one"),
            (PromptRole::Assistant, "ok"),
            (PromptRole::User, "two"),
        ]
    );
}

#[tokio::test]
async fn test_reasoning_metadata_becomes_leading_segment() {
    let mut metadata = Map::new();
    metadata.insert("reasoning_content".into(), Value::String("2+2 is 4".into()));
    let h = harness(Script::Reply(ModelResponse {
        text: "4".into(),
        finish_reason: Some("stop".into()),
        usage: TokenUsage::new(3, 1),
        metadata,
    }));

    let turn = h.chat.send(request(1, 7, None, "2+2?")).await.unwrap();
    let kinds: Vec<_> = turn
        .assistant_message
        .segments
        .iter()
        .map(|s| s.kind.clone())
        .collect();
    assert_eq!(kinds, vec![SegmentType::Reasoning, SegmentType::Text]);
    assert_eq!(turn.assistant_message.content.as_deref(), Some("4"));
}

#[tokio::test]
async fn test_backend_failure_is_recorded() {
    let h = harness(Script::Fail("request timed out".into()));

    let turn = h.chat.send(request(1, 7, None, "Hello")).await.unwrap();
    let message = &turn.assistant_message;

    assert_eq!(message.message_type, MessageType::Error);
    assert_eq!(message.status, STATUS_FAILED);
    assert_eq!(message.segments.len(), 1);
    assert_eq!(message.segments[0].kind, SegmentType::Error);
    assert!(message.segments[0].text.contains("request timed out"));
    assert_eq!(message.error_code.as_deref(), Some(MODEL_INVOCATION_ERROR));
    assert!(message.input_tokens.is_none());
    assert!(message.cost.is_none());

    assert!(!turn.usage.success);
    assert!(turn.usage.latency_ms >= 1);
    assert!(turn.usage.input_tokens.is_none());
    assert!(turn.usage.cost.is_none());

    assert_eq!(turn.session.message_count, 2);
    assert_eq!(turn.session.token_count, 0);
}

#[tokio::test]
async fn test_http_timeout_becomes_error_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let db = Arc::new(Database::open_in_memory().unwrap());
    db.migrate().unwrap();
    db.import_catalog(&Catalog::parse(CATALOG).unwrap()).unwrap();

    let mut config = Config::default();
    config.http.timeout_secs = 1;
    config.providers.insert(
        "openai".into(),
        agentchat_core::config::ProviderOverride {
            base_url: Some(server.uri()),
        },
    );
    let chat = ChatOrchestrator::new(db.clone(), ProviderDispatcher::new(&config), &config);

    let turn = chat.send(request(1, 7, None, "Hello")).await.unwrap();

    assert_eq!(turn.assistant_message.message_type, MessageType::Error);
    assert_eq!(turn.assistant_message.status, STATUS_FAILED);
    assert!(!turn.usage.success);
    assert!(turn.usage.latency_ms >= 1000);
}

// ============================================
// Aborted turns
// ============================================

#[tokio::test]
async fn test_foreign_or_deleted_session_is_not_found() {
    let h = harness(reply("ok", 1, 1));
    let turn = h.chat.send(request(1, 7, None, "mine")).await.unwrap();
    let session_id = turn.session.id;

    let err = h
        .chat
        .send(request(2, 7, Some(session_id), "not yours"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(id) if id == session_id));

    assert!(h.db.soft_delete_session(session_id, 1).unwrap());
    let err = h
        .chat
        .send(request(1, 7, Some(session_id), "again"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));

    assert_eq!(h.db.session_messages(session_id).unwrap().len(), 2);
}

#[tokio::test]
async fn test_configuration_errors_write_nothing() {
    let h = harness(reply("ok", 1, 1));

    let err = h.chat.send(request(1, 8, None, "hi")).await.unwrap_err();
    assert!(matches!(err, Error::MissingCredential(_)));

    let err = h.chat.send(request(1, 9, None, "hi")).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedProvider(_)));

    let err = h.chat.send(request(1, 42, None, "hi")).await.unwrap_err();
    assert!(matches!(err, Error::ReferenceNotFound { kind: "agent", id: 42 }));

    assert!(h.db.list_user_sessions(1).unwrap().is_empty());
    assert!(h.model.prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_stream_configuration_error_is_returned_directly() {
    let h = harness(Script::Stream(vec![]));
    let err = h
        .chat
        .send_stream(request(1, 8, None, "hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingCredential(_)));
    assert!(h.db.list_user_sessions(1).unwrap().is_empty());
}

// ============================================
// Streaming turns
// ============================================

#[tokio::test]
async fn test_stream_coalesces_reasoning_and_text() {
    let last = ModelChunk {
        finish_reason: Some("stop".into()),
        usage: Some(TokenUsage::new(9, 4)),
        ..Default::default()
    };
    let h = harness(Script::Stream(vec![
        ModelChunk::reasoning("Thinking: "),
        ModelChunk::reasoning("2+2=4 "),
        ModelChunk::text("Answer: 4"),
        last,
    ]));

    let rx = h
        .chat
        .send_stream(request(1, 7, None, "2+2?"))
        .await
        .unwrap();
    let events = collect(rx).await;

    assert!(matches!(
        events[0],
        StreamEvent::Session {
            new_session: true,
            finished: false,
            ..
        }
    ));
    let deltas: Vec<_> = events[1..4]
        .iter()
        .map(|e| match e {
            StreamEvent::Delta {
                delta, segment_type, ..
            } => (segment_type.clone(), delta.as_str()),
            other => panic!("expected delta, got {:?}", other),
        })
        .collect();
    assert_eq!(
        deltas,
        vec![
            (SegmentType::Reasoning, "Thinking: "),
            (SegmentType::Reasoning, "2+2=4 "),
            (SegmentType::Text, "Answer: 4"),
        ]
    );
    assert_eq!(events.len(), 5);

    let StreamEvent::Complete {
        session_id,
        message,
        metadata,
        finished,
        ..
    } = &events[4]
    else {
        panic!("expected complete, got {:?}", events[4]);
    };
    assert!(*finished);
    assert_eq!(metadata.total_tokens, Some(13));
    assert_eq!(message.segments.len(), 2);
    assert_eq!(message.segments[0].text, "Thinking: 2+2=4 ");
    assert_eq!(message.segments[1].text, "Answer: 4");
    assert_eq!(message.content.as_deref(), Some("Answer: 4"));
    assert_eq!(message.finish_reason.as_deref(), Some("stop"));

    let session = h.db.get_session(*session_id).unwrap().unwrap();
    assert_eq!(session.message_count, 2);
    assert_eq!(session.token_count, 13);

    let usage = h.db.usage_for_session(*session_id).unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].operation.as_str(), "chat_stream");
}

#[tokio::test]
async fn test_stream_failure_keeps_partial_output() {
    let h = harness(Script::StreamFail(
        vec![ModelChunk::text("Partial ")],
        "connection reset".into(),
    ));

    let rx = h
        .chat
        .send_stream(request(1, 7, None, "Hello"))
        .await
        .unwrap();
    let events = collect(rx).await;

    let StreamEvent::Error {
        session_id,
        error,
        message,
        ..
    } = events.last().unwrap()
    else {
        panic!("expected error event");
    };
    assert!(error.contains("connection reset"));

    let message = message.as_ref().unwrap();
    assert_eq!(message.message_type, MessageType::Error);
    let kinds: Vec<_> = message.segments.iter().map(|s| s.kind.clone()).collect();
    assert_eq!(kinds, vec![SegmentType::Text, SegmentType::Error]);
    assert_eq!(message.segments[0].text, "Partial ");

    let usage = h.db.usage_summary(*session_id).unwrap();
    assert_eq!(usage.calls, 1);
    assert_eq!(usage.failures, 1);
}

#[tokio::test]
async fn test_stream_persists_after_receiver_dropped() {
    let h = harness(Script::Stream(vec![
        ModelChunk::text("still "),
        ModelChunk::text("saved"),
    ]));

    let rx = h
        .chat
        .send_stream(request(1, 7, None, "Hello"))
        .await
        .unwrap();
    drop(rx);

    let session_id = h.db.list_user_sessions(1).unwrap()[0].id;
    let mut messages = Vec::new();
    for _ in 0..100 {
        messages = h.db.session_messages(session_id).unwrap();
        if messages.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content.as_deref(), Some("still saved"));
}

#[tokio::test]
async fn test_same_session_turns_are_serialized() {
    let h = harness(reply("ok", 1, 1));
    let first = h.chat.send(request(1, 7, None, "start")).await.unwrap();
    let session_id = first.session.id;

    let a = {
        let chat = h.chat.clone();
        tokio::spawn(async move { chat.send(request(1, 7, Some(session_id), "a")).await })
    };
    let b = {
        let chat = h.chat.clone();
        tokio::spawn(async move { chat.send(request(1, 7, Some(session_id), "b")).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let messages = h.db.session_messages(session_id).unwrap();
    assert_eq!(messages.len(), 6);
    // every assistant reply directly follows its own user message
    for pair in messages.chunks(2) {
        assert_eq!(pair[0].role, MessageRole::User);
        assert_eq!(pair[1].role, MessageRole::Assistant);
        assert_eq!(pair[1].parent_id, Some(pair[0].id));
    }
}
