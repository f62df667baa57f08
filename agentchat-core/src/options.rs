//! Mapping agent parameters onto effective generation options
//!
//! Agent fields override model defaults; anything still absent is left unset
//! so the backend default applies. Stored free-form fields (stop sequences,
//! tool choice) never fail a turn: malformed values log a warning and fall
//! back.

use serde_json::Value;

use crate::llm::{GenerationOptions, ToolChoice};
use crate::types::{AgentProfile, ModelProfile};

/// Parse stored stop sequences.
///
/// A JSON array of strings is taken as-is. Values without any JSON bracket
/// or quote are split on commas, trimmed, with empties dropped. Anything that
/// looks like JSON but does not parse as a string array yields an empty list.
pub fn parse_stop_sequences(raw: Option<&str>) -> Vec<String> {
    let raw = match raw.map(str::trim) {
        Some(r) if !r.is_empty() => r,
        _ => return Vec::new(),
    };

    if raw.contains(['[', ']', '{', '}', '"']) {
        return match serde_json::from_str::<Vec<String>>(raw) {
            Ok(list) => list.into_iter().filter(|s| !s.is_empty()).collect(),
            Err(e) => {
                tracing::warn!(raw = %raw, error = %e, "Ignoring malformed stop sequences");
                Vec::new()
            }
        };
    }

    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parse a stored tool-choice value.
///
/// Values starting with `{` are parsed as a JSON object; if that fails, or
/// for any other value, the raw text is passed through as a literal.
pub fn parse_tool_choice(raw: Option<&str>) -> Option<ToolChoice> {
    let raw = raw.map(str::trim).filter(|r| !r.is_empty())?;

    if raw.starts_with('{') {
        match serde_json::from_str::<Value>(raw) {
            Ok(value @ Value::Object(_)) => return Some(ToolChoice::Object(value)),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(raw = %raw, error = %e, "Tool choice is not valid JSON, using literal");
            }
        }
    }
    Some(ToolChoice::Literal(raw.to_string()))
}

/// Agent max tokens, else the model's max output tokens, else absent.
pub fn resolve_max_tokens(agent: &AgentProfile, model: &ModelProfile) -> Option<u32> {
    agent
        .max_tokens
        .filter(|n| *n > 0)
        .or(model.max_output_tokens.filter(|n| *n > 0))
}

/// Build effective options for one call.
pub fn build_options(agent: &AgentProfile, model: &ModelProfile) -> GenerationOptions {
    GenerationOptions {
        model: model.model_key.clone(),
        temperature: agent.temperature.or(model.default_temperature),
        top_p: agent.top_p.or(model.default_top_p),
        presence_penalty: agent.presence_penalty,
        frequency_penalty: agent.frequency_penalty,
        max_tokens: resolve_max_tokens(agent, model),
        stop: parse_stop_sequences(agent.stop_sequences.as_deref()),
        tool_choice: parse_tool_choice(agent.tool_choice.as_deref()),
        // Tool execution is out of scope: `tool_ids` are stored but never
        // become definitions, so adapters drop `tool_choice` on the wire
        tools: Vec::new(),
    }
}
