//! Provider dispatch
//!
//! Maps a [`ChatModelDescriptor`] onto exactly one backend adapter and
//! produces the [`RuntimeContext`] for a single call.
//!
//! The set of adapters is closed ([`ProviderKind`]). Provider codes are
//! normalized (trimmed, lowercased) and looked up in an alias map built once
//! when the dispatcher is constructed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::llm::{
    anthropic, openai, AnthropicChatModel, ChatModel, ClientPool, GenerationOptions,
    OpenAiChatModel, OpenAiDialect, PoolKey,
};
use crate::options::build_options;
use crate::types::ChatModelDescriptor;

/// Backend adapters known to the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    DashScope,
    DeepSeek,
    ZhipuAi,
    Ollama,
    OpenAiCompatible,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 7] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::DashScope,
        ProviderKind::DeepSeek,
        ProviderKind::ZhipuAi,
        ProviderKind::Ollama,
        ProviderKind::OpenAiCompatible,
    ];

    /// Canonical provider code
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::DashScope => "dashscope",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::ZhipuAi => "zhipuai",
            ProviderKind::Ollama => "ollama",
            ProviderKind::OpenAiCompatible => "openai_compatible",
        }
    }

    /// Every code that selects this adapter
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            ProviderKind::OpenAi => &["openai"],
            ProviderKind::Anthropic => &["anthropic", "claude"],
            ProviderKind::DashScope => &["dashscope", "qwen", "tongyi"],
            ProviderKind::DeepSeek => &["deepseek"],
            ProviderKind::ZhipuAi => &["zhipuai", "zhipu", "glm"],
            ProviderKind::Ollama => &["ollama"],
            ProviderKind::OpenAiCompatible => &["openai_compatible", "openai-compatible", "custom"],
        }
    }

    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("https://api.openai.com/v1"),
            ProviderKind::Anthropic => Some("https://api.anthropic.com"),
            ProviderKind::DashScope => Some("https://dashscope.aliyuncs.com/compatible-mode/v1"),
            ProviderKind::DeepSeek => Some("https://api.deepseek.com/v1"),
            ProviderKind::ZhipuAi => Some("https://open.bigmodel.cn/api/paas/v4"),
            ProviderKind::Ollama => Some("http://localhost:11434/v1"),
            ProviderKind::OpenAiCompatible => None,
        }
    }

    /// Only local Ollama may run without an API key
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, ProviderKind::Ollama)
    }

    fn dialect(&self) -> Option<OpenAiDialect> {
        match self {
            ProviderKind::OpenAi => Some(OpenAiDialect::OPENAI),
            ProviderKind::DashScope => Some(OpenAiDialect::DASHSCOPE),
            ProviderKind::DeepSeek => Some(OpenAiDialect::DEEPSEEK),
            ProviderKind::ZhipuAi => Some(OpenAiDialect::ZHIPUAI),
            ProviderKind::Ollama => Some(OpenAiDialect::OLLAMA),
            ProviderKind::OpenAiCompatible => Some(OpenAiDialect::COMPATIBLE),
            ProviderKind::Anthropic => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_lowercase()
}

/// Normalized connection parameters for building a model handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub kind: ProviderKind,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Turns connection parameters into a callable model handle
pub trait ModelFactory: Send + Sync {
    fn build(&self, params: &ConnectionParams) -> Result<Arc<dyn ChatModel>>;

    /// Drop cached transport state for a provider
    fn invalidate(&self, _kind: ProviderKind) -> usize {
        0
    }
}

/// Factory backed by pooled `reqwest` clients
pub struct HttpModelFactory {
    pool: ClientPool,
}

impl HttpModelFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            pool: ClientPool::new(connect_timeout),
        }
    }

    pub fn pool(&self) -> &ClientPool {
        &self.pool
    }
}

impl ModelFactory for HttpModelFactory {
    fn build(&self, params: &ConnectionParams) -> Result<Arc<dyn ChatModel>> {
        let api_key = params.api_key.as_deref();
        let key = PoolKey::new(
            params.kind.as_str(),
            &params.base_url,
            api_key,
            params.timeout,
        );

        let model: Arc<dyn ChatModel> = match params.kind.dialect() {
            Some(dialect) => {
                let client = self
                    .pool
                    .get_or_build(&key, openai::default_headers(api_key)?)?;
                Arc::new(OpenAiChatModel::new(client, &params.base_url, dialect))
            }
            None => {
                let client = self
                    .pool
                    .get_or_build(&key, anthropic::default_headers(api_key)?)?;
                Arc::new(AnthropicChatModel::new(client, &params.base_url))
            }
        };
        Ok(model)
    }

    fn invalidate(&self, kind: ProviderKind) -> usize {
        self.pool.invalidate_provider(kind.as_str())
    }
}

/// Everything needed to execute one call. Built per call, never shared.
#[derive(Clone)]
pub struct RuntimeContext {
    pub model: Arc<dyn ChatModel>,
    pub options: GenerationOptions,
    pub descriptor: Arc<ChatModelDescriptor>,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("provider", &self.model.provider())
            .field("options", &self.options)
            .field("agent_id", &self.descriptor.agent.id)
            .finish()
    }
}

pub struct ProviderDispatcher {
    aliases: HashMap<&'static str, ProviderKind>,
    config: Config,
    factory: Arc<dyn ModelFactory>,
}

impl ProviderDispatcher {
    pub fn new(config: &Config) -> Self {
        let factory = Arc::new(HttpModelFactory::new(config.http.connect_timeout()));
        Self::with_factory(config, factory)
    }

    pub fn with_factory(config: &Config, factory: Arc<dyn ModelFactory>) -> Self {
        let aliases = ProviderKind::ALL
            .iter()
            .flat_map(|kind| kind.aliases().iter().map(move |alias| (*alias, *kind)))
            .collect();

        Self {
            aliases,
            config: config.clone(),
            factory,
        }
    }

    /// Resolve a stored provider code to its adapter.
    pub fn resolve_kind(&self, code: &str) -> Result<ProviderKind> {
        self.aliases
            .get(normalize_code(code).as_str())
            .copied()
            .ok_or_else(|| Error::UnsupportedProvider(code.to_string()))
    }

    /// Profile override, then operator config (by stored code, then canonical
    /// code), then the adapter default.
    fn resolve_base_url(&self, kind: ProviderKind, descriptor: &ChatModelDescriptor) -> Result<String> {
        let profile_url = descriptor
            .provider
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty());
        if let Some(url) = profile_url {
            return Ok(url.to_string());
        }

        self.config
            .provider_base_url(descriptor.provider_code())
            .or_else(|| self.config.provider_base_url(kind.as_str()))
            .or_else(|| kind.default_base_url())
            .map(String::from)
            .ok_or_else(|| {
                Error::Config(format!(
                    "provider '{}' has no base URL configured",
                    descriptor.provider_code()
                ))
            })
    }

    /// Select the adapter for a descriptor and build its runtime context.
    pub fn select(&self, descriptor: Arc<ChatModelDescriptor>) -> Result<RuntimeContext> {
        let code = descriptor.provider_code();
        let kind = self.resolve_kind(code)?;

        if !descriptor.provider.enabled {
            return Err(Error::UnsupportedProvider(format!("{} (disabled)", code)));
        }

        let base_url = self.resolve_base_url(kind, &descriptor)?;

        let api_key = descriptor
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(String::from);
        if api_key.is_none() && kind.requires_api_key() {
            return Err(Error::MissingCredential(code.to_string()));
        }

        let params = ConnectionParams {
            kind,
            base_url,
            api_key,
            timeout: self.config.http.timeout(),
        };
        let model = self.factory.build(&params)?;
        let options = build_options(&descriptor.agent, &descriptor.model);

        tracing::debug!(
            provider = %kind,
            base_url = %params.base_url,
            model = %options.model,
            agent_id = descriptor.agent.id,
            "Selected model backend"
        );

        Ok(RuntimeContext {
            model,
            options,
            descriptor,
        })
    }

    /// Drop pooled clients for a provider code, e.g. after its key changed.
    pub fn invalidate_provider(&self, code: &str) -> Result<usize> {
        let kind = self.resolve_kind(code)?;
        Ok(self.factory.invalidate(kind))
    }
}
