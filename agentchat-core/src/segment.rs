//! Typed message segments and the streaming accumulator
//!
//! Assistant output is stored as an ordered list of [`Segment`]s so that
//! reasoning ("thinking") text can be shown separately from the answer.
//! The rendered content of a message is always the in-order concatenation of
//! its segment texts.
//!
//! During a streaming call a [`StreamAccumulator`] coalesces deltas of the
//! same type into one [`SegmentBuffer`]. The accumulator is a plain value:
//! every step consumes it and hands back the updated state, so it can only
//! ever have one owner.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Instant;

/// Metadata keys whose presence marks a delta or response field as reasoning.
///
/// This is an explicit allow-list. Provider metadata keys outside it are
/// never treated as reasoning.
pub const REASONING_METADATA_KEYS: &[&str] =
    &["reasoning_content", "reasoning", "thinking", "thinking_content"];

/// Type tag of a segment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SegmentType {
    Text,
    Reasoning,
    Error,
    /// Tool-specific segment types are kept verbatim
    Other(String),
}

impl SegmentType {
    pub fn as_str(&self) -> &str {
        match self {
            SegmentType::Text => "text",
            SegmentType::Reasoning => "reasoning",
            SegmentType::Error => "error",
            SegmentType::Other(name) => name,
        }
    }

    pub fn is_reasoning(&self) -> bool {
        matches!(self, SegmentType::Reasoning)
    }
}

impl From<String> for SegmentType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "text" => SegmentType::Text,
            "reasoning" | "thinking" => SegmentType::Reasoning,
            "error" => SegmentType::Error,
            _ => SegmentType::Other(value),
        }
    }
}

impl From<SegmentType> for String {
    fn from(value: SegmentType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for SegmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed span of message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub kind: SegmentType,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Segment {
    pub fn new(kind: SegmentType, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            metadata: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(SegmentType::Text, text)
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::new(SegmentType::Reasoning, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(SegmentType::Error, text)
    }
}

/// Concatenate every segment text in order.
pub fn join_text(segments: &[Segment]) -> String {
    segments.iter().map(|s| s.text.as_str()).collect()
}

/// Flatten segments for replay into a prompt: reasoning is UI-only and dropped.
pub fn flatten_for_prompt(segments: &[Segment]) -> String {
    segments
        .iter()
        .filter(|s| !s.kind.is_reasoning())
        .map(|s| s.text.as_str())
        .collect()
}

/// Serialize segments for the `segments` column.
pub fn to_storage(segments: &[Segment]) -> crate::error::Result<String> {
    Ok(serde_json::to_string(segments)?)
}

/// Restore segments from storage.
///
/// Rows written before structured content existed hold plain text; those come
/// back as a single text segment. Segments are returned exactly as stored and
/// are never merged.
pub fn from_storage(raw: &str) -> Vec<Segment> {
    if raw.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<Segment>>(raw) {
        Ok(segments) => segments,
        Err(e) => {
            tracing::debug!(error = %e, "Stored content is not a segment list, treating as text");
            vec![Segment::text(raw)]
        }
    }
}

/// Render stored content; empty content renders as `None`.
pub fn render(raw: &str) -> Option<String> {
    let text = join_text(&from_storage(raw));
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Whether a metadata map marks its payload as reasoning.
///
/// A key counts when it is allow-listed and carries a non-empty string or `true`.
pub fn is_reasoning_metadata(metadata: &Map<String, Value>) -> bool {
    REASONING_METADATA_KEYS
        .iter()
        .filter_map(|key| metadata.get(*key))
        .any(|value| match value {
            Value::String(s) => !s.is_empty(),
            Value::Bool(b) => *b,
            _ => false,
        })
}

/// Pull reasoning text out of a complete response's metadata.
///
/// Returns one reasoning segment per allow-listed key holding non-empty text,
/// in allow-list order.
pub fn reasoning_segments(metadata: &Map<String, Value>) -> Vec<Segment> {
    REASONING_METADATA_KEYS
        .iter()
        .filter_map(|key| metadata.get(*key).and_then(Value::as_str))
        .filter(|text| !text.trim().is_empty())
        .map(Segment::reasoning)
        .collect()
}

// ============================================
// Streaming accumulator
// ============================================

/// Contiguous run of same-type deltas
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentBuffer {
    pub kind: SegmentType,
    pub text: String,
}

/// Per-call streaming state. Not persisted.
#[derive(Debug)]
pub struct StreamAccumulator {
    buffers: Vec<SegmentBuffer>,
    metadata: Map<String, Value>,
    started_at: Instant,
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self {
            buffers: Vec::new(),
            metadata: Map::new(),
            started_at: Instant::now(),
        }
    }

    /// Append a delta, opening a new buffer only when the type changes.
    pub fn push(mut self, kind: SegmentType, delta: &str) -> Self {
        if delta.is_empty() {
            return self;
        }
        match self.buffers.last_mut() {
            Some(last) if last.kind == kind => last.text.push_str(delta),
            _ => self.buffers.push(SegmentBuffer {
                kind,
                text: delta.to_string(),
            }),
        }
        self
    }

    /// Fold chunk metadata into the call's metadata. Later values win per
    /// key; reasoning keys are skipped since they already became segments.
    pub fn observe(mut self, metadata: &Map<String, Value>) -> Self {
        for (key, value) in metadata {
            if REASONING_METADATA_KEYS.contains(&key.as_str()) || value.is_null() {
                continue;
            }
            self.metadata.insert(key.clone(), value.clone());
        }
        self
    }

    pub fn buffers(&self) -> &[SegmentBuffer] {
        &self.buffers
    }

    /// Last-seen value of each metadata key on the stream
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Consume the accumulator into final segments.
    pub fn finish(self) -> Vec<Segment> {
        self.buffers
            .into_iter()
            .map(|b| Segment::new(b.kind, b.text))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_matches_join() {
        let segments = vec![
            Segment::reasoning("Let me think. "),
            Segment::text("Answer"),
            Segment::new(SegmentType::Other("tool_call".into()), "{}"),
        ];
        let stored = to_storage(&segments).unwrap();
        assert_eq!(render(&stored).unwrap(), join_text(&segments));
        assert_eq!(from_storage(&stored), segments);
    }

    #[test]
    fn test_empty_renders_absent() {
        let stored = to_storage(&[]).unwrap();
        assert_eq!(render(&stored), None);
        assert_eq!(render(""), None);
    }

    #[test]
    fn test_plain_text_storage_is_single_segment() {
        let segments = from_storage("legacy text");
        assert_eq!(segments, vec![Segment::text("legacy text")]);
    }

    #[test]
    fn test_flatten_drops_reasoning() {
        let segments = vec![
            Segment::reasoning("hidden"),
            Segment::text("a"),
            Segment::error("b"),
        ];
        assert_eq!(flatten_for_prompt(&segments), "ab");
    }

    #[test]
    fn test_segment_type_serialization() {
        let json = serde_json::to_value(Segment::reasoning("x")).unwrap();
        assert_eq!(json, json!({"type": "reasoning", "text": "x"}));

        let parsed: Segment = serde_json::from_value(json!({"type": "citation", "text": "y"})).unwrap();
        assert_eq!(parsed.kind, SegmentType::Other("citation".into()));
    }

    #[test]
    fn test_same_type_deltas_coalesce() {
        let deltas = ["a", "b", "c", "d"];
        let acc = deltas
            .iter()
            .fold(StreamAccumulator::new(), |acc, d| acc.push(SegmentType::Text, d));
        assert_eq!(acc.buffers().len(), 1);
        assert_eq!(acc.buffers()[0].text, "abcd");
    }

    #[test]
    fn test_type_change_opens_new_buffer() {
        let acc = StreamAccumulator::new()
            .push(SegmentType::Reasoning, "Thinking: ")
            .push(SegmentType::Reasoning, "2+2=4 ")
            .push(SegmentType::Text, "Answer: 4")
            .push(SegmentType::Reasoning, "again");

        let segments = acc.finish();
        assert_eq!(
            segments,
            vec![
                Segment::reasoning("Thinking: 2+2=4 "),
                Segment::text("Answer: 4"),
                Segment::reasoning("again"),
            ]
        );
    }

    #[test]
    fn test_observe_keeps_latest_value_per_key() {
        let mut first = Map::new();
        first.insert("response_id".into(), json!("msg_1"));
        first.insert("reasoning_content".into(), json!("step"));
        let mut second = Map::new();
        second.insert("model".into(), json!("m-1"));
        let mut third = Map::new();
        third.insert("model".into(), json!("m-2"));
        third.insert("response_id".into(), Value::Null);

        let acc = StreamAccumulator::new()
            .observe(&first)
            .observe(&Map::new())
            .observe(&second)
            .observe(&third);

        assert_eq!(acc.metadata().get("response_id"), Some(&json!("msg_1")));
        assert_eq!(acc.metadata().get("model"), Some(&json!("m-2")));
        assert!(!acc.metadata().contains_key("reasoning_content"));
        assert!(acc.is_empty());
    }

    #[test]
    fn test_empty_delta_is_ignored() {
        let acc = StreamAccumulator::new().push(SegmentType::Text, "");
        assert!(acc.is_empty());
    }

    #[test]
    fn test_reasoning_metadata_allow_list() {
        let mut meta = Map::new();
        meta.insert("reasoning_content".into(), json!("step 1"));
        assert!(is_reasoning_metadata(&meta));

        let mut other = Map::new();
        other.insert("reasoning_tokens".into(), json!(42));
        other.insert("my_thinking_flag".into(), json!(true));
        assert!(!is_reasoning_metadata(&other));

        let mut flag = Map::new();
        flag.insert("thinking".into(), json!(true));
        assert!(is_reasoning_metadata(&flag));
    }

    #[test]
    fn test_reasoning_segments_skip_blank() {
        let mut meta = Map::new();
        meta.insert("reasoning_content".into(), json!("thought"));
        meta.insert("thinking".into(), json!("  "));
        assert_eq!(reasoning_segments(&meta), vec![Segment::reasoning("thought")]);
    }
}
