//! Provider construction from configuration.
//!
//! The backend is picked once, from an explicit [`ProviderKind`] tag, and
//! every configured provider gets its own concurrency gate.

use std::collections::HashMap;
use std::sync::Arc;

use opsloop_config::{AppConfig, ProviderConfig};
use opsloop_core::error::ProviderError;
use opsloop_core::provider::Provider;
use tracing::debug;

use crate::anthropic::{self, AnthropicProvider};
use crate::gate::GatedProvider;
use crate::openai_compat::OpenAiCompatProvider;

/// The provider-type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    OpenAiCompat,
}

impl ProviderKind {
    /// Parse an explicit `kind` value.
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "anthropic" => Some(Self::Anthropic),
            "openai_compat" | "openai" => Some(Self::OpenAiCompat),
            _ => None,
        }
    }

    /// The kind a provider table implies when it sets none.
    pub fn infer(name: &str) -> Self {
        if name == "anthropic" {
            Self::Anthropic
        } else {
            Self::OpenAiCompat
        }
    }
}

/// Everything needed to build one adapter.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub name: String,
    pub kind: ProviderKind,
    pub api_key: String,
    pub api_url: String,
    pub model: String,
    pub max_concurrency: usize,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl ProviderSettings {
    /// Resolve a `[providers.<name>]` table, filling in well-known defaults.
    pub fn from_config(name: &str, config: &ProviderConfig) -> Result<Self, ProviderError> {
        let kind = match &config.kind {
            Some(kind) => ProviderKind::parse(kind).ok_or_else(|| {
                ProviderError::not_configured(format!("unknown provider kind '{kind}'"))
            })?,
            None => ProviderKind::infer(name),
        };

        let api_url = config
            .api_url
            .clone()
            .or_else(|| default_base_url(name, kind))
            .ok_or_else(|| {
                ProviderError::not_configured(format!("provider '{name}' needs an api_url"))
            })?;

        let model = config
            .model
            .clone()
            .or_else(|| default_model(name, kind))
            .ok_or_else(|| {
                ProviderError::not_configured(format!("provider '{name}' needs a model"))
            })?;

        Ok(Self {
            name: name.to_string(),
            kind,
            api_key: config.api_key.clone().unwrap_or_default(),
            api_url,
            model,
            max_concurrency: config.max_concurrency,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

/// Build the adapter a settings block describes.
pub fn build_provider(settings: &ProviderSettings) -> Arc<dyn Provider> {
    match settings.kind {
        ProviderKind::Anthropic => Arc::new(
            AnthropicProvider::new(&settings.api_key)
                .with_base_url(&settings.api_url)
                .with_name(&settings.name),
        ),
        ProviderKind::OpenAiCompat => Arc::new(OpenAiCompatProvider::new(
            &settings.name,
            &settings.api_url,
            &settings.api_key,
        )),
    }
}

/// A built provider plus the request defaults it was configured with.
#[derive(Clone)]
pub struct PooledProvider {
    pub provider: Arc<dyn Provider>,
    pub settings: ProviderSettings,
}

/// One gated adapter per configured provider name, shared by every session.
pub struct ProviderPool {
    providers: HashMap<String, PooledProvider>,
    default_provider: String,
}

impl ProviderPool {
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
        }
    }

    /// Register a provider under its settings name, wrapped in a gate.
    pub fn register(&mut self, settings: ProviderSettings, provider: Arc<dyn Provider>) {
        let gated: Arc<dyn Provider> =
            Arc::new(GatedProvider::new(provider, settings.max_concurrency));
        self.providers.insert(
            settings.name.clone(),
            PooledProvider {
                provider: gated,
                settings,
            },
        );
    }

    /// Build every provider the configuration names, plus the default
    /// provider if it is a well-known name without a table.
    pub fn build_from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        let mut pool = Self::new(&config.default_provider);

        let mut names: Vec<&str> = config.providers.keys().map(String::as_str).collect();
        if !config.providers.contains_key(&config.default_provider) {
            names.push(&config.default_provider);
        }

        for name in names {
            let table = config.provider(name).ok_or_else(|| {
                ProviderError::not_configured(format!("provider '{name}' is not configured"))
            })?;
            let settings = ProviderSettings::from_config(name, &table)?;
            debug!(
                provider = %settings.name,
                kind = ?settings.kind,
                model = %settings.model,
                max_concurrency = settings.max_concurrency,
                "Registered provider"
            );
            let provider = build_provider(&settings);
            pool.register(settings, provider);
        }

        Ok(pool)
    }

    pub fn get(&self, name: &str) -> Option<&PooledProvider> {
        self.providers.get(name)
    }

    pub fn default_provider(&self) -> Option<&PooledProvider> {
        self.providers.get(&self.default_provider)
    }

    /// List all registered provider names.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Default base URL for well-known providers.
fn default_base_url(name: &str, kind: ProviderKind) -> Option<String> {
    if kind == ProviderKind::Anthropic {
        return Some(anthropic::DEFAULT_BASE_URL.into());
    }
    let url = match name {
        "openai" => "https://api.openai.com/v1",
        "openrouter" => "https://openrouter.ai/api/v1",
        "ollama" => "http://localhost:11434/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "deepseek" => "https://api.deepseek.com/v1",
        _ => return None,
    };
    Some(url.into())
}

fn default_model(name: &str, kind: ProviderKind) -> Option<String> {
    if kind == ProviderKind::Anthropic {
        return Some(anthropic::DEFAULT_MODEL.into());
    }
    let model = match name {
        "openai" => "gpt-4o",
        "openrouter" => "anthropic/claude-sonnet-4",
        "ollama" => "llama3.1",
        "groq" => "llama-3.3-70b-versatile",
        "deepseek" => "deepseek-chat",
        _ => return None,
    };
    Some(model.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parsing_and_inference() {
        assert_eq!(ProviderKind::parse("anthropic"), Some(ProviderKind::Anthropic));
        assert_eq!(
            ProviderKind::parse("openai_compat"),
            Some(ProviderKind::OpenAiCompat)
        );
        assert_eq!(ProviderKind::parse("gemini"), None);
        assert_eq!(ProviderKind::infer("anthropic"), ProviderKind::Anthropic);
        assert_eq!(ProviderKind::infer("ollama"), ProviderKind::OpenAiCompat);
    }

    #[test]
    fn settings_fill_well_known_defaults() {
        let settings = ProviderSettings::from_config("openai", &ProviderConfig::default()).unwrap();
        assert_eq!(settings.kind, ProviderKind::OpenAiCompat);
        assert!(settings.api_url.contains("api.openai.com"));
        assert_eq!(settings.model, "gpt-4o");

        let settings =
            ProviderSettings::from_config("anthropic", &ProviderConfig::default()).unwrap();
        assert_eq!(settings.kind, ProviderKind::Anthropic);
        assert_eq!(settings.model, anthropic::DEFAULT_MODEL);
    }

    #[test]
    fn custom_provider_needs_url_and_model() {
        let err = ProviderSettings::from_config("vllm", &ProviderConfig::default()).unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured { .. }));

        let config = ProviderConfig {
            kind: Some("openai_compat".into()),
            api_url: Some("http://vllm:8000/v1".into()),
            model: Some("qwen".into()),
            ..ProviderConfig::default()
        };
        let settings = ProviderSettings::from_config("vllm", &config).unwrap();
        assert_eq!(settings.api_url, "http://vllm:8000/v1");
    }

    #[test]
    fn build_from_default_config() {
        let config = AppConfig::default();
        let pool = ProviderPool::build_from_config(&config).unwrap();
        let default = pool.default_provider().unwrap();
        assert_eq!(default.provider.name(), "anthropic");
        assert_eq!(pool.list(), vec!["anthropic"]);
    }

    #[test]
    fn build_from_config_with_named_tables() {
        let config: AppConfig = toml::from_str(
            r#"
default_provider = "claude"
default_model = "claude-opus-4-20250514"

[providers.claude]
kind = "anthropic"
max_concurrency = 2

[providers.local]
kind = "openai_compat"
api_url = "http://localhost:11434/v1"
model = "llama3"
"#,
        )
        .unwrap();

        let pool = ProviderPool::build_from_config(&config).unwrap();
        assert_eq!(pool.list(), vec!["claude", "local"]);

        let claude = pool.default_provider().unwrap();
        assert_eq!(claude.provider.name(), "claude");
        assert_eq!(claude.settings.model, "claude-opus-4-20250514");
        assert_eq!(claude.settings.max_concurrency, 2);

        assert_eq!(pool.get("local").unwrap().settings.model, "llama3");
    }
}
