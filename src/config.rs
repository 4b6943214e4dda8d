//! Configuration for the colonel core, persisted as TOML.
//!
//! Every field carries a serde default, so an empty file (or no file at all)
//! yields a working configuration. Durations are stored as plain seconds or
//! milliseconds and exposed as [`Duration`] through accessor methods.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::{ModelCatalog, ModelProfile};

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "COLONEL_CONFIG";

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "colonel.toml";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColonelConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl ColonelConfig {
    /// Load a config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content, &path.display().to_string())
    }

    /// Parse a config from TOML text. `origin` is only used in error messages.
    pub fn from_toml(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })?;
        config.models.catalog()?;
        Ok(config)
    }

    /// Resolve the config path: explicit argument, then `COLONEL_CONFIG`,
    /// then `./colonel.toml` if it exists.
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        local.exists().then_some(local)
    }

    /// Load from the located path, or fall back to defaults when none exists.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match Self::locate(explicit) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Serialize to pretty TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: "<in-memory>".into(),
            message: e.to_string(),
        })
    }

    /// Write the config to disk, refusing to clobber an existing file.
    pub fn write_new(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_toml()?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| ConfigError::Write {
                path: path.display().to_string(),
                source,
            })?;
        std::io::Write::write_all(&mut file, content.as_bytes()).map_err(|source| {
            ConfigError::Write {
                path: path.display().to_string(),
                source,
            }
        })
    }
}

// ── Session ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a confirmation prompt stays answerable.
    #[serde(default = "default_expiry_seconds")]
    pub expiry_seconds: u64,
    /// Idle sessions are closed after this long.
    #[serde(default = "default_idle_ttl_seconds")]
    pub idle_ttl_seconds: u64,
    /// Overall deadline for one streamed model turn.
    #[serde(default = "default_model_turn_timeout_seconds")]
    pub model_turn_timeout_seconds: u64,
    /// Consecutive model/tool rounds allowed per user message.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Consecutive backend failures tolerated before the session is closed.
    #[serde(default = "default_backend_retry_budget")]
    pub backend_retry_budget: u32,
    /// Number of most recent turns sent to the model.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Session titles are cut to this many characters.
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,
    /// Directory for persisted sessions. In-memory when absent.
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
}

fn default_expiry_seconds() -> u64 {
    60
}
fn default_idle_ttl_seconds() -> u64 {
    86_400
}
fn default_model_turn_timeout_seconds() -> u64 {
    120
}
fn default_max_tool_rounds() -> u32 {
    5
}
fn default_backend_retry_budget() -> u32 {
    3
}
fn default_history_window() -> usize {
    20
}
fn default_title_max_chars() -> usize {
    60
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_seconds: default_expiry_seconds(),
            idle_ttl_seconds: default_idle_ttl_seconds(),
            model_turn_timeout_seconds: default_model_turn_timeout_seconds(),
            max_tool_rounds: default_max_tool_rounds(),
            backend_retry_budget: default_backend_retry_budget(),
            history_window: default_history_window(),
            title_max_chars: default_title_max_chars(),
            store_dir: None,
        }
    }
}

impl SessionConfig {
    pub fn confirmation_expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_seconds)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_seconds)
    }

    pub fn model_turn_timeout(&self) -> Duration {
        Duration::from_secs(self.model_turn_timeout_seconds)
    }
}

// ── Executor ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Timeout for actions that do not declare their own.
    #[serde(default = "default_action_timeout_seconds")]
    pub default_action_timeout_seconds: u64,
    /// Global limit on concurrently running actions, across all sessions.
    #[serde(default = "default_max_concurrent_actions")]
    pub max_concurrent_actions: usize,
    /// Sanitized output is truncated to this many characters.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

fn default_action_timeout_seconds() -> u64 {
    30
}
fn default_max_concurrent_actions() -> usize {
    8
}
fn default_max_output_chars() -> usize {
    8000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_action_timeout_seconds: default_action_timeout_seconds(),
            max_concurrent_actions: default_max_concurrent_actions(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

impl ExecutorConfig {
    pub fn default_action_timeout(&self) -> Duration {
        Duration::from_secs(self.default_action_timeout_seconds)
    }
}

// ── Audit ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// JSONL audit log. In-memory when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_audit_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_audit_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_audit_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_audit_max_attempts() -> u32 {
    3
}
fn default_audit_attempt_timeout_ms() -> u64 {
    2000
}
fn default_audit_retry_backoff_ms() -> u64 {
    100
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_attempts: default_audit_max_attempts(),
            attempt_timeout_ms: default_audit_attempt_timeout_ms(),
            retry_backoff_ms: default_audit_retry_backoff_ms(),
        }
    }
}

// ── Policy ───────────────────────────────────────────────────────────────

/// Additive policy tuning. The built-in blocklist cannot be shrunk from here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Extra regular expressions that deny unconditionally.
    #[serde(default)]
    pub extra_blocked_patterns: Vec<String>,
    /// Extra regular expressions that require confirmation.
    #[serde(default)]
    pub extra_confirmation_patterns: Vec<ConfirmationPatternConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationPatternConfig {
    pub pattern: String,
    pub description: String,
}

// ── Models ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Model id a new session starts with.
    #[serde(default = "default_model_id")]
    pub default: String,
    /// Case-insensitive globs naming models trusted with write actions.
    #[serde(default = "default_write_capable_patterns")]
    pub write_capable_patterns: Vec<String>,
    #[serde(default = "default_profiles")]
    pub profiles: Vec<ModelProfileConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfileConfig {
    pub id: String,
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub context_window: u32,
    /// Explicit trust tier; overrides `write_capable_patterns` when set.
    #[serde(default)]
    pub write_capable: Option<bool>,
}

fn default_model_id() -> String {
    "anthropic/claude-sonnet-4-5".into()
}

fn default_write_capable_patterns() -> Vec<String> {
    vec![
        "anthropic/claude-opus-4*".into(),
        "anthropic/claude-sonnet-4*".into(),
        "openai/gpt-4o*".into(),
    ]
}

fn default_profiles() -> Vec<ModelProfileConfig> {
    vec![
        ModelProfileConfig {
            id: "anthropic/claude-sonnet-4-5".into(),
            name: "Claude Sonnet 4.5".into(),
            provider: "Anthropic".into(),
            context_window: 200_000,
            write_capable: None,
        },
        ModelProfileConfig {
            id: "openai/gpt-4o-mini".into(),
            name: "GPT-4o mini".into(),
            provider: "OpenAI".into(),
            context_window: 128_000,
            write_capable: None,
        },
        ModelProfileConfig {
            id: "local/qwen2.5-7b-instruct".into(),
            name: "Qwen 2.5 7B".into(),
            provider: "Local".into(),
            context_window: 32_768,
            write_capable: None,
        },
    ]
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default: default_model_id(),
            write_capable_patterns: default_write_capable_patterns(),
            profiles: default_profiles(),
        }
    }
}

impl ModelsConfig {
    /// Resolve profiles into a catalog, applying the write-capable globs.
    pub fn catalog(&self) -> Result<ModelCatalog, ConfigError> {
        let matcher = crate::policy::ModelTrust::new(&self.write_capable_patterns)?;
        let profiles = self
            .profiles
            .iter()
            .map(|p| ModelProfile {
                id: p.id.clone(),
                name: p.name.clone(),
                provider: p.provider.clone(),
                context_window: p.context_window,
                write_capable: p
                    .write_capable
                    .unwrap_or_else(|| matcher.is_write_capable(&p.id)),
            })
            .collect();
        ModelCatalog::new(profiles, &self.default)
    }
}

// ── Skills ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    /// Directories scanned for `*.skill.md` / `*.skill.toml` files.
    #[serde(default = "default_skill_dirs")]
    pub dirs: Vec<PathBuf>,
    /// Skills exposed to sessions. Empty means every loaded skill.
    #[serde(default)]
    pub enabled: Vec<String>,
}

fn default_skill_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("skills")]
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            dirs: default_skill_dirs(),
            enabled: Vec::new(),
        }
    }
}

// ── Backend ──────────────────────────────────────────────────────────────

/// OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_backend_url() -> String {
    "http://localhost:4000/v1/chat/completions".into()
}
fn default_api_key_env() -> String {
    "COLONEL_BACKEND_API_KEY".into()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    4096
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

// ── Server ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8300".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = ColonelConfig::from_toml("", "test").unwrap();
        assert_eq!(config.session.expiry_seconds, 60);
        assert_eq!(config.executor.default_action_timeout_seconds, 30);
        assert_eq!(config.session.max_tool_rounds, 5);
        assert_eq!(config.executor.max_output_chars, 8000);
        assert!(config.audit.path.is_none());
    }

    #[test]
    fn recognised_options_override_defaults() {
        let config = ColonelConfig::from_toml(
            r#"
            [session]
            expiry_seconds = 15

            [executor]
            default_action_timeout_seconds = 5
            max_concurrent_actions = 2
            "#,
            "test",
        )
        .unwrap();
        assert_eq!(config.session.confirmation_expiry(), Duration::from_secs(15));
        assert_eq!(config.executor.default_action_timeout(), Duration::from_secs(5));
        assert_eq!(config.executor.max_concurrent_actions, 2);
        // Untouched sections keep their defaults.
        assert_eq!(config.session.idle_ttl_seconds, 86_400);
    }

    #[test]
    fn default_catalog_applies_globs() {
        let catalog = ModelsConfig::default().catalog().unwrap();
        assert!(catalog.get("anthropic/claude-sonnet-4-5").unwrap().write_capable);
        assert!(catalog.get("openai/gpt-4o-mini").unwrap().write_capable);
        assert!(!catalog.get("local/qwen2.5-7b-instruct").unwrap().write_capable);
    }

    #[test]
    fn explicit_write_capable_wins_over_globs() {
        let config = ColonelConfig::from_toml(
            r#"
            [models]
            default = "anthropic/claude-opus-4-1"
            write_capable_patterns = ["anthropic/*"]

            [[models.profiles]]
            id = "anthropic/claude-opus-4-1"
            name = "Opus"
            provider = "Anthropic"
            write_capable = false
            "#,
            "test",
        )
        .unwrap();
        let catalog = config.models.catalog().unwrap();
        assert!(!catalog.default_profile().write_capable);
    }

    #[test]
    fn unknown_default_model_is_rejected() {
        let err = ColonelConfig::from_toml(
            r#"
            [models]
            default = "missing"
            "#,
            "test",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDefaultModel { .. }));
    }

    #[test]
    fn write_new_refuses_to_overwrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("colonel.toml");
        ColonelConfig::default().write_new(&path).unwrap();
        let reloaded = ColonelConfig::load(&path).unwrap();
        assert_eq!(reloaded.session.expiry_seconds, 60);
        assert!(ColonelConfig::default().write_new(&path).is_err());
    }
}
