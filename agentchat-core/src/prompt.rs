//! Prompt assembly
//!
//! Turns the agent's system prompt template and a bounded window of prior
//! session messages into the ordered prompt sent to a backend.

use chrono::{NaiveDate, Utc};

use crate::llm::PromptMessage;
use crate::segment;
use crate::types::{ChatMessage, ChatModelDescriptor, MessageRole};

/// Replace `{{agent_name}}`, `{{model}}` and `{{date}}`.
///
/// Unknown placeholders are left untouched.
pub fn render_template(template: &str, descriptor: &ChatModelDescriptor, today: NaiveDate) -> String {
    let model = descriptor
        .model
        .display_name
        .as_deref()
        .unwrap_or(&descriptor.model.model_key);

    template
        .replace("{{agent_name}}", &descriptor.agent.name)
        .replace("{{model}}", model)
        .replace("{{date}}", &today.format("%Y-%m-%d").to_string())
}

#[derive(Debug, Clone, Copy)]
pub struct PromptAssembler {
    window: usize,
}

impl PromptAssembler {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }

    /// Number of prior messages replayed into each prompt
    pub fn window(&self) -> usize {
        self.window
    }

    /// Build the prompt from a history page fetched newest-first.
    pub fn build(&self, descriptor: &ChatModelDescriptor, history: Vec<ChatMessage>) -> Vec<PromptMessage> {
        self.build_at(descriptor, history, Utc::now().date_naive())
    }

    pub fn build_at(
        &self,
        descriptor: &ChatModelDescriptor,
        mut history: Vec<ChatMessage>,
        today: NaiveDate,
    ) -> Vec<PromptMessage> {
        // Keep only the newest `window` entries, then replay oldest first
        history.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        history.truncate(self.window);
        history.reverse();

        let mut prompt = Vec::with_capacity(history.len() + 1);

        if let Some(template) = &descriptor.prompt {
            let system = render_template(&template.content, descriptor, today);
            if !system.trim().is_empty() {
                prompt.push(PromptMessage::system(system));
            }
        }

        for message in &history {
            let text = segment::flatten_for_prompt(&message.segments);
            if text.is_empty() {
                continue;
            }
            prompt.push(match message.role {
                MessageRole::System => PromptMessage::system(text),
                MessageRole::Assistant => PromptMessage::assistant(text),
                _ => PromptMessage::user(text),
            });
        }

        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::PromptRole;
    use crate::segment::Segment;
    use crate::types::*;
    use chrono::{Duration, TimeZone};

    fn descriptor(template: Option<&str>) -> ChatModelDescriptor {
        let catalog = crate::catalog::Catalog::parse(
            r#"
[[providers]]
id = 1
code = "openai"

[[models]]
id = 3
provider_id = 1
model_key = "gpt-4o-mini"

[[agents]]
id = 7
name = "Helper"
model_id = 3
"#,
        )
        .unwrap();

        ChatModelDescriptor {
            operator_id: 1,
            agent: catalog.agents[0].clone(),
            model: catalog.models[0].clone(),
            provider: catalog.providers[0].clone(),
            prompt: template.map(|content| PromptTemplate {
                id: 2,
                name: "p".into(),
                content: content.into(),
            }),
            api_key: None,
        }
    }

    fn message(id: i64, offset_secs: i64, role: MessageRole, segments: Vec<Segment>) -> ChatMessage {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        ChatMessage {
            id,
            session_id: 1,
            parent_id: None,
            role,
            message_type: MessageType::Normal,
            segments,
            content: None,
            status: STATUS_OK,
            finish_reason: None,
            input_tokens: None,
            output_tokens: None,
            latency_ms: None,
            cost: None,
            error_code: None,
            error_message: None,
            created_at: base + Duration::seconds(offset_secs),
            attachments: vec![],
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 2).unwrap()
    }

    #[test]
    fn test_template_rendering() {
        let d = descriptor(Some("You are {{agent_name}} on {{model}}, {{date}}. {{unknown}}"));
        let prompt = PromptAssembler::new(30).build_at(&d, vec![], today());
        assert_eq!(prompt.len(), 1);
        assert_eq!(
            prompt[0].content,
            "You are Helper on gpt-4o-mini, 2026-01-02. {{unknown}}"
        );
        assert_eq!(prompt[0].role, PromptRole::System);
    }

    #[test]
    fn test_history_is_chronological_with_id_tiebreak() {
        let d = descriptor(None);
        // newest-first, with two messages sharing a timestamp
        let history = vec![
            message(4, 10, MessageRole::Assistant, vec![Segment::text("d")]),
            message(3, 5, MessageRole::User, vec![Segment::text("c")]),
            message(2, 5, MessageRole::User, vec![Segment::text("b")]),
            message(1, 0, MessageRole::User, vec![Segment::text("a")]),
        ];

        let prompt = PromptAssembler::new(30).build_at(&d, history, today());
        let texts: Vec<_> = prompt.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c", "d"]);
        assert_eq!(prompt[3].role, PromptRole::Assistant);
    }

    #[test]
    fn test_window_keeps_newest() {
        let d = descriptor(None);
        let history = (1..=5)
            .map(|i| message(i, i, MessageRole::User, vec![Segment::text(i.to_string())]))
            .collect();

        let prompt = PromptAssembler::new(2).build_at(&d, history, today());
        let texts: Vec<_> = prompt.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["4", "5"]);
    }

    #[test]
    fn test_reasoning_excluded_and_empty_skipped() {
        let d = descriptor(None);
        let history = vec![
            message(
                2,
                1,
                MessageRole::Assistant,
                vec![Segment::reasoning("secret"), Segment::text("Answer: 4")],
            ),
            message(1, 0, MessageRole::Assistant, vec![Segment::reasoning("only thoughts")]),
        ];

        let prompt = PromptAssembler::new(30).build_at(&d, history, today());
        assert_eq!(prompt.len(), 1);
        assert_eq!(prompt[0].content, "Answer: 4");
    }

    #[test]
    fn test_tool_role_maps_to_user() {
        let d = descriptor(None);
        let history = vec![message(1, 0, MessageRole::Tool, vec![Segment::text("result")])];
        let prompt = PromptAssembler::new(30).build_at(&d, history, today());
        assert_eq!(prompt[0].role, PromptRole::User);
    }
}
