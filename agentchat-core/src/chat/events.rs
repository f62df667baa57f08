//! Streaming event surface
//!
//! Events serialize as JSON objects tagged by `type` with camelCase fields.
//! A stream always starts with exactly one `session` event and ends with
//! exactly one `complete` or `error` event.

use serde::{Deserialize, Serialize};

use crate::llm::TokenUsage;
use crate::segment::SegmentType;
use crate::types::ChatMessage;

/// Token counts reported with a completed turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

impl From<TokenUsage> for UsageMetadata {
    fn from(usage: TokenUsage) -> Self {
        let total = match (usage.input_tokens, usage.output_tokens) {
            (None, None) => None,
            _ => Some(usage.total()),
        };
        Self {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            total_tokens: total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    Session {
        session_id: i64,
        new_session: bool,
        finished: bool,
    },
    #[serde(rename_all = "camelCase")]
    Delta {
        session_id: i64,
        delta: String,
        segment_type: SegmentType,
        finished: bool,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        session_id: i64,
        new_session: bool,
        finished: bool,
        message: Box<ChatMessage>,
        metadata: UsageMetadata,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        session_id: i64,
        new_session: bool,
        finished: bool,
        /// Failure summary
        error: String,
        /// The persisted error message, absent if persisting failed too
        message: Option<Box<ChatMessage>>,
    },
}

impl StreamEvent {
    pub fn session(session_id: i64, new_session: bool) -> Self {
        StreamEvent::Session {
            session_id,
            new_session,
            finished: false,
        }
    }

    pub fn delta(session_id: i64, delta: impl Into<String>, segment_type: SegmentType) -> Self {
        StreamEvent::Delta {
            session_id,
            delta: delta.into(),
            segment_type,
            finished: false,
        }
    }

    pub fn complete(session_id: i64, new_session: bool, message: ChatMessage, usage: TokenUsage) -> Self {
        StreamEvent::Complete {
            session_id,
            new_session,
            finished: true,
            message: Box::new(message),
            metadata: usage.into(),
        }
    }

    pub fn error(
        session_id: i64,
        new_session: bool,
        error: impl Into<String>,
        message: Option<ChatMessage>,
    ) -> Self {
        StreamEvent::Error {
            session_id,
            new_session,
            finished: true,
            error: error.into(),
            message: message.map(Box::new),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_event_shape() {
        let value = serde_json::to_value(StreamEvent::session(5, true)).unwrap();
        assert_eq!(
            value,
            json!({"type": "session", "sessionId": 5, "newSession": true, "finished": false})
        );
    }

    #[test]
    fn test_delta_event_shape() {
        let value =
            serde_json::to_value(StreamEvent::delta(5, "Think", SegmentType::Reasoning)).unwrap();
        assert_eq!(value["type"], "delta");
        assert_eq!(value["segmentType"], "reasoning");
        assert_eq!(value["delta"], "Think");
        assert!(!StreamEvent::delta(5, "x", SegmentType::Text).is_terminal());
    }

    #[test]
    fn test_error_event_is_terminal() {
        let event = StreamEvent::error(5, false, "boom", None);
        assert!(event.is_terminal());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["finished"], true);
        assert_eq!(value["error"], "boom");
    }

    #[test]
    fn test_complete_event_survives_json() {
        use crate::segment::Segment;
        use crate::types::{MessageRole, MessageType, STATUS_OK};
        use chrono::{TimeZone, Utc};

        let message = ChatMessage {
            id: 2,
            session_id: 5,
            parent_id: Some(1),
            role: MessageRole::Assistant,
            message_type: MessageType::Normal,
            segments: vec![Segment::reasoning("hmm"), Segment::text("4")],
            content: Some("4".into()),
            status: STATUS_OK,
            finish_reason: Some("stop".into()),
            input_tokens: Some(3),
            output_tokens: Some(1),
            latency_ms: Some(40),
            cost: None,
            error_code: None,
            error_message: None,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap(),
            attachments: vec![],
        };
        let event = StreamEvent::complete(5, false, message.clone(), TokenUsage::new(3, 1));

        let json = serde_json::to_string(&event).unwrap();
        let back: StreamEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_ne!(back, StreamEvent::error(5, false, "boom", Some(message)));
    }

    #[test]
    fn test_usage_metadata_totals() {
        let meta = UsageMetadata::from(TokenUsage::new(12, 6));
        assert_eq!(meta.total_tokens, Some(18));
        assert_eq!(UsageMetadata::from(TokenUsage::default()).total_tokens, None);
    }
}
