//! Configuration loading and validation for opsloop.
//!
//! Loads configuration from `~/.opsloop/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Provider names that resolve without an explicit `[providers.<name>]` table.
pub const WELL_KNOWN_PROVIDERS: &[&str] =
    &["anthropic", "openai", "openrouter", "ollama", "groq", "deepseek"];

/// Accepted values for `providers.<name>.kind`.
pub const PROVIDER_KINDS: &[&str] = &["anthropic", "openai_compat"];

/// The root configuration structure.
///
/// Maps directly to `~/.opsloop/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Shared API key, used by providers that don't set their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Provider used by `run` and `resume`
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Model override applied to the default provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,

    /// Loop controller settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Tool dispatch retry settings
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Session store settings
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Plugin endpoints, described once at startup
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

fn default_provider() -> String {
    "anthropic".into()
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("providers", &self.providers)
            .field("agent", &self.agent)
            .field("dispatcher", &self.dispatcher)
            .field("sessions", &self.sessions)
            .field("plugins", &self.plugins)
            .finish()
    }
}

/// One `[providers.<name>]` table.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider-type tag: `anthropic` or `openai_compat`. Inferred from the
    /// table name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Concurrent requests allowed across all sessions sharing this provider
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_max_concurrency() -> usize {
    4
}
fn default_temperature() -> f32 {
    0.2
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: None,
            api_key: None,
            api_url: None,
            model: None,
            max_concurrency: default_max_concurrency(),
            temperature: default_temperature(),
            max_tokens: None,
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("max_concurrency", &self.max_concurrency)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Upper bound on a single provider call
    #[serde(default = "default_iteration_timeout")]
    pub iteration_timeout_secs: u64,

    /// Whole-loop deadline; none by default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_deadline_secs: Option<u64>,

    #[serde(default = "default_attempts")]
    pub provider_max_attempts: u32,

    /// Backoff between provider attempts, doubled per attempt up to the max
    #[serde(default = "default_provider_base_delay_ms")]
    pub provider_base_delay_ms: u64,

    #[serde(default = "default_provider_max_delay_ms")]
    pub provider_max_delay_ms: u64,

    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_max_iterations() -> u32 {
    20
}
fn default_iteration_timeout() -> u64 {
    120
}
fn default_attempts() -> u32 {
    3
}
fn default_provider_base_delay_ms() -> u64 {
    500
}
fn default_provider_max_delay_ms() -> u64 {
    10_000
}
fn default_batch_concurrency() -> usize {
    5
}
fn default_system_prompt() -> String {
    "You are an operations assistant. Use the available tools to investigate \
     before answering, and answer concisely once you have enough information."
        .into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            iteration_timeout_secs: default_iteration_timeout(),
            session_deadline_secs: None,
            provider_max_attempts: default_attempts(),
            provider_base_delay_ms: default_provider_base_delay_ms(),
            provider_max_delay_ms: default_provider_max_delay_ms(),
            batch_concurrency: default_batch_concurrency(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl AgentConfig {
    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }

    pub fn session_deadline(&self) -> Option<Duration> {
        self.session_deadline_secs.map(Duration::from_secs)
    }

    pub fn provider_base_delay(&self) -> Duration {
        Duration::from_millis(self.provider_base_delay_ms)
    }

    pub fn provider_max_delay(&self) -> Duration {
        Duration::from_millis(self.provider_max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    200
}
fn default_max_delay_ms() -> u64 {
    5000
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl DispatcherConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Directory holding one JSON file per session. `~` expands to $HOME.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    /// Inactivity after which `sweep` expires a session
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
}

fn default_ttl() -> u64 {
    86_400
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            ttl_secs: default_ttl(),
        }
    }
}

impl SessionsConfig {
    /// Resolved session directory.
    pub fn dir(&self) -> PathBuf {
        match &self.dir {
            Some(dir) => expand_home(dir),
            None => AppConfig::config_dir().join("sessions"),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// One `[[plugins]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,

    /// Base URL; the dispatcher posts to `<address>/execute`
    pub address: String,

    #[serde(default = "default_plugin_timeout")]
    pub timeout_secs: u64,
}

fn default_plugin_timeout() -> u64 {
    30
}

impl PluginConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.opsloop/config.toml).
    ///
    /// Also checks environment variables:
    /// - `OPSLOOP_API_KEY` (then `ANTHROPIC_API_KEY`, `OPENAI_API_KEY`)
    /// - `OPSLOOP_PROVIDER`, `OPSLOOP_MODEL`, `OPSLOOP_SESSION_DIR`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific file path, then apply environment
    /// overrides and validate.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            toml::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            tracing::info!("No config file found at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup. Split out so tests don't
    /// have to mutate the process environment.
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        if self.api_key.is_none() {
            self.api_key = env("OPSLOOP_API_KEY")
                .or_else(|| env("ANTHROPIC_API_KEY"))
                .or_else(|| env("OPENAI_API_KEY"));
        }
        if let Some(provider) = env("OPSLOOP_PROVIDER") {
            self.default_provider = provider;
        }
        if let Some(model) = env("OPSLOOP_MODEL") {
            self.default_model = Some(model);
        }
        if let Some(dir) = env("OPSLOOP_SESSION_DIR") {
            self.sessions.dir = Some(dir);
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".opsloop")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid =
            |msg: String| -> Result<(), ConfigError> { Err(ConfigError::ValidationError(msg)) };

        if self.agent.max_iterations < 1 {
            return invalid("agent.max_iterations must be >= 1".into());
        }
        if self.agent.provider_max_attempts < 1 {
            return invalid("agent.provider_max_attempts must be >= 1".into());
        }
        if self.agent.provider_base_delay_ms > self.agent.provider_max_delay_ms {
            return invalid("agent.provider_base_delay_ms must not exceed provider_max_delay_ms".into());
        }
        if self.agent.batch_concurrency < 1 {
            return invalid("agent.batch_concurrency must be >= 1".into());
        }
        if self.dispatcher.max_attempts < 1 {
            return invalid("dispatcher.max_attempts must be >= 1".into());
        }
        if self.dispatcher.base_delay_ms > self.dispatcher.max_delay_ms {
            return invalid("dispatcher.base_delay_ms must not exceed max_delay_ms".into());
        }

        for (name, provider) in &self.providers {
            if provider.max_concurrency < 1 {
                return invalid(format!("providers.{name}.max_concurrency must be >= 1"));
            }
            if !(0.0..=2.0).contains(&provider.temperature) {
                return invalid(format!(
                    "providers.{name}.temperature must be between 0.0 and 2.0"
                ));
            }
            if let Some(kind) = &provider.kind
                && !PROVIDER_KINDS.contains(&kind.as_str())
            {
                return invalid(format!(
                    "providers.{name}.kind '{kind}' is not one of {PROVIDER_KINDS:?}"
                ));
            }
        }

        if !self.providers.contains_key(&self.default_provider)
            && !WELL_KNOWN_PROVIDERS.contains(&self.default_provider.as_str())
        {
            return invalid(format!(
                "default_provider '{}' has no [providers.{}] table",
                self.default_provider, self.default_provider
            ));
        }

        let mut seen = HashSet::new();
        for plugin in &self.plugins {
            if !seen.insert(plugin.name.as_str()) {
                return invalid(format!("duplicate plugin name '{}'", plugin.name));
            }
            if !(plugin.address.starts_with("http://") || plugin.address.starts_with("https://"))
            {
                return invalid(format!(
                    "plugin '{}' address must start with http:// or https://",
                    plugin.name
                ));
            }
        }

        Ok(())
    }

    /// Settings for a named provider, synthesizing defaults for well-known
    /// names that have no table of their own.
    pub fn provider(&self, name: &str) -> Option<ProviderConfig> {
        let mut settings = match self.providers.get(name) {
            Some(p) => p.clone(),
            None if WELL_KNOWN_PROVIDERS.contains(&name) => ProviderConfig::default(),
            None => return None,
        };
        if settings.api_key.is_none() {
            settings.api_key = self.api_key.clone();
        }
        if name == self.default_provider && self.default_model.is_some() {
            settings.model = self.default_model.clone();
        }
        Some(settings)
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some() || self.providers.values().any(|p| p.api_key.is_some())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: None,
            providers: BTreeMap::new(),
            agent: AgentConfig::default(),
            dispatcher: DispatcherConfig::default(),
            sessions: SessionsConfig::default(),
            plugins: vec![],
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs_home().join(rest),
        None if path == "~" => dirs_home(),
        None => PathBuf::from(path),
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const FULL: &str = r#"
default_provider = "claude"
api_key = "sk-shared"

[providers.claude]
kind = "anthropic"
model = "claude-sonnet-4-20250514"
max_concurrency = 2

[providers.local]
kind = "openai_compat"
api_url = "http://localhost:11434/v1"
model = "llama3"
api_key = "sk-local"

[agent]
max_iterations = 8
session_deadline_secs = 600
provider_base_delay_ms = 1000

[dispatcher]
max_attempts = 4
base_delay_ms = 50

[sessions]
dir = "/var/lib/opsloop/sessions"
ttl_secs = 3600

[[plugins]]
name = "kubernetes"
address = "http://localhost:8081"

[[plugins]]
name = "search"
address = "https://search.internal"
timeout_secs = 5
"#;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.default_provider, "anthropic");
        assert_eq!(config.agent.max_iterations, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn full_config_parses() {
        let config: AppConfig = toml::from_str(FULL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.providers["claude"].max_concurrency, 2);
        assert_eq!(config.providers["local"].max_concurrency, 4);
        assert_eq!(config.agent.max_iterations, 8);
        assert_eq!(config.agent.session_deadline(), Some(Duration::from_secs(600)));
        // Provider and tool backoff are tuned independently
        assert_eq!(config.agent.provider_base_delay(), Duration::from_secs(1));
        assert_eq!(config.agent.provider_max_delay(), Duration::from_secs(10));
        assert_eq!(config.dispatcher.base_delay(), Duration::from_millis(50));
        assert_eq!(config.dispatcher.max_attempts, 4);
        assert_eq!(config.dispatcher.max_delay_ms, 5000);
        assert_eq!(config.sessions.dir(), PathBuf::from("/var/lib/opsloop/sessions"));
        assert_eq!(config.plugins.len(), 2);
        assert_eq!(config.plugins[0].timeout(), Duration::from_secs(30));
        assert_eq!(config.plugins[1].timeout_secs, 5);
    }

    #[test]
    fn provider_settings_inherit_shared_key() {
        let config: AppConfig = toml::from_str(FULL).unwrap();
        let claude = config.provider("claude").unwrap();
        assert_eq!(claude.api_key.as_deref(), Some("sk-shared"));
        let local = config.provider("local").unwrap();
        assert_eq!(local.api_key.as_deref(), Some("sk-local"));

        // Well-known names resolve without a table
        assert!(config.provider("openai").is_some());
        assert!(config.provider("nope").is_none());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("ANTHROPIC_API_KEY", "sk-env"),
            ("OPSLOOP_MODEL", "claude-opus"),
            ("OPSLOOP_SESSION_DIR", "/tmp/sessions"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.api_key.as_deref(), Some("sk-env"));
        assert_eq!(
            config.provider("anthropic").unwrap().model.as_deref(),
            Some("claude-opus")
        );
        assert_eq!(config.sessions.dir(), PathBuf::from("/tmp/sessions"));
    }

    #[test]
    fn config_key_is_not_replaced_by_env() {
        let mut config = AppConfig {
            api_key: Some("sk-file".into()),
            ..AppConfig::default()
        };
        config.apply_env(|k| (k == "OPSLOOP_API_KEY").then(|| "sk-env".to_string()));
        assert_eq!(config.api_key.as_deref(), Some("sk-file"));
    }

    #[test]
    fn invalid_settings_rejected() {
        let mut config = AppConfig::default();
        config.agent.max_iterations = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.dispatcher.base_delay_ms = 10_000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.agent.provider_base_delay_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.providers.insert(
            "anthropic".into(),
            ProviderConfig {
                temperature: 5.0,
                ..ProviderConfig::default()
            },
        );
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.providers.insert(
            "anthropic".into(),
            ProviderConfig {
                kind: Some("gemini".into()),
                ..ProviderConfig::default()
            },
        );
        assert!(config.validate().is_err());

        let config = AppConfig {
            default_provider: "mystery".into(),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn plugin_validation() {
        let plugin = |name: &str, address: &str| PluginConfig {
            name: name.into(),
            address: address.into(),
            timeout_secs: 30,
        };

        let config = AppConfig {
            plugins: vec![plugin("k8s", "http://a"), plugin("k8s", "http://b")],
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());

        let config = AppConfig {
            plugins: vec![plugin("k8s", "localhost:8081")],
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = AppConfig::load_from(Path::new("/nonexistent/config.toml"));
        assert!(result.is_ok());
    }

    #[test]
    fn load_from_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "agent = [").unwrap();
        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, FULL).unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.default_provider, "claude");
    }

    #[test]
    fn debug_redacts_secrets() {
        let config: AppConfig = toml::from_str(FULL).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-shared"));
        assert!(!debug.contains("sk-local"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_roundtrips() {
        let toml_str = AppConfig::default_toml();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.default_provider, "anthropic");
        assert_eq!(parsed.sessions.ttl_secs, 86_400);
    }
}
