//! Catalog documents
//!
//! Operators register providers, models, prompts and agents through a TOML
//! document that is imported into the database in one transaction:
//!
//! ```toml
//! [[providers]]
//! id = 1
//! code = "openai"
//! api_key = "env:OPENAI_API_KEY"
//!
//! [[models]]
//! id = 3
//! provider_id = 1
//! model_key = "gpt-4o-mini"
//! input_price_per_1k = "0.00015"
//! output_price_per_1k = "0.0006"
//!
//! [[agents]]
//! id = 7
//! name = "helper"
//! model_id = 3
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::{AgentProfile, ModelProfile, PromptTemplate, ProviderProfile};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub providers: Vec<ProviderProfile>,
    #[serde(default)]
    pub models: Vec<ModelProfile>,
    #[serde(default)]
    pub prompts: Vec<PromptTemplate>,
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
}

/// Row counts written by an import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub providers: usize,
    pub models: usize,
    pub prompts: usize,
    pub agents: usize,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read catalog {:?}: {}", path, e)))?;
        let catalog = Self::parse(&content)?;
        tracing::info!(path = %path.display(), "Loaded catalog");
        Ok(catalog)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let catalog: Catalog = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse catalog: {}", e)))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Check references inside the document.
    ///
    /// References to rows that already exist in the database cannot be seen
    /// here; those surface as `ReferenceNotFound` when an agent is used.
    pub fn validate(&self) -> Result<()> {
        let duplicate = |kind: &str, ids: Vec<i64>| -> Result<HashSet<i64>> {
            let mut seen = HashSet::new();
            for id in ids {
                if !seen.insert(id) {
                    return Err(Error::Config(format!("duplicate {} id {} in catalog", kind, id)));
                }
            }
            Ok(seen)
        };

        duplicate("provider", self.providers.iter().map(|p| p.id).collect())?;
        duplicate("model", self.models.iter().map(|m| m.id).collect())?;
        duplicate("prompt", self.prompts.iter().map(|p| p.id).collect())?;
        duplicate("agent", self.agents.iter().map(|a| a.id).collect())?;

        if let Some(p) = self.providers.iter().find(|p| p.code.trim().is_empty()) {
            return Err(Error::Config(format!("provider {} has an empty code", p.id)));
        }
        if let Some(m) = self.models.iter().find(|m| m.model_key.trim().is_empty()) {
            return Err(Error::Config(format!("model {} has an empty model_key", m.id)));
        }
        Ok(())
    }

    pub fn summary(&self) -> ImportSummary {
        ImportSummary {
            providers: self.providers.len(),
            models: self.models.len(),
            prompts: self.prompts.len(),
            agents: self.agents.len(),
        }
    }
}
