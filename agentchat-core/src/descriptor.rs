//! Descriptor assembly
//!
//! Resolves an agent id into the read-only [`ChatModelDescriptor`] the
//! dispatcher consumes: agent, model, provider, optional prompt template and
//! the provider secret.

use std::sync::Arc;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::ChatModelDescriptor;

const ENV_PREFIX: &str = "env:";

/// Resolve a stored secret.
///
/// `env:NAME` reads the named environment variable; an unset or empty
/// variable resolves to no key. Anything else is a literal key.
pub fn resolve_secret(stored: Option<&str>) -> Option<String> {
    let stored = stored.map(str::trim).filter(|s| !s.is_empty())?;

    match stored.strip_prefix(ENV_PREFIX) {
        Some(var) => match std::env::var(var.trim()) {
            Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
            _ => {
                tracing::warn!(var = %var, "Provider secret references an unset environment variable");
                None
            }
        },
        None => Some(stored.to_string()),
    }
}

pub struct DescriptorAssembler {
    db: Arc<Database>,
}

impl DescriptorAssembler {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Build a fresh descriptor for one orchestration call.
    pub fn assemble(&self, agent_id: i64, operator_id: i64) -> Result<ChatModelDescriptor> {
        let agent = self
            .db
            .get_agent(agent_id)?
            .ok_or(Error::ReferenceNotFound {
                kind: "agent",
                id: agent_id,
            })?;

        let model = self
            .db
            .get_model(agent.model_id)?
            .ok_or(Error::ReferenceNotFound {
                kind: "model",
                id: agent.model_id,
            })?;

        let provider = self
            .db
            .get_provider(model.provider_id)?
            .ok_or(Error::ReferenceNotFound {
                kind: "provider",
                id: model.provider_id,
            })?;

        let prompt = match agent.prompt_id {
            Some(prompt_id) => Some(self.db.get_prompt(prompt_id)?.ok_or(
                Error::ReferenceNotFound {
                    kind: "prompt",
                    id: prompt_id,
                },
            )?),
            None => None,
        };

        let api_key = resolve_secret(provider.api_key.as_deref());

        tracing::debug!(
            agent_id,
            operator_id,
            model = %model.model_key,
            provider = %provider.code,
            has_prompt = prompt.is_some(),
            has_key = api_key.is_some(),
            "Assembled descriptor"
        );

        Ok(ChatModelDescriptor {
            operator_id,
            agent,
            model,
            provider,
            prompt,
            api_key,
        })
    }
}
