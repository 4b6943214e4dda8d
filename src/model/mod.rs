//! Model profiles and the model-backend collaborator.
//!
//! The core treats inference as a black box: [`ModelBackend::generate`] takes
//! the conversation and yields a stream of [`ModelEvent`]s, token deltas and at
//! most one tool call proposal. Two backends ship with the crate:
//!
//! - [`ScriptedBackend`]: replays canned replies, for tests and demos;
//! - `OpenAiBackend` (feature `llm-http`): streams from an OpenAI-compatible
//!   chat completion endpoint.

#[cfg(feature = "llm-http")]
pub mod openai;
mod scripted;

use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ConfigError;
use crate::session::Turn;

#[cfg(feature = "llm-http")]
pub use self::openai::OpenAiBackend;
pub use self::scripted::{ScriptedBackend, ScriptedReply};

// ── Errors ───────────────────────────────────────────────────────────────

/// Failures talking to the model backend. All of them count as the backend
/// being unavailable for the session's retry budget.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum BackendError {
    #[error("model backend unavailable: {message}")]
    #[diagnostic(
        code(colonel::backend::unavailable),
        help("Check that the inference endpoint is running and reachable.")
    )]
    Unavailable { message: String },

    #[error("model backend request failed ({status}): {message}")]
    #[diagnostic(
        code(colonel::backend::request_failed),
        help("The endpoint rejected the request. Check the model id, API key and request size.")
    )]
    RequestFailed { status: u16, message: String },

    #[error("model backend returned malformed output: {message}")]
    #[diagnostic(
        code(colonel::backend::parse),
        help("The stream did not follow the chat completion format.")
    )]
    Parse { message: String },

    #[error("model turn timed out after {seconds}s")]
    #[diagnostic(
        code(colonel::backend::timeout),
        help("Increase `session.model_turn_timeout_seconds` or use a faster model.")
    )]
    Timeout { seconds: u64 },
}

// ── Profiles ─────────────────────────────────────────────────────────────

/// A selectable model and its trust tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub id: String,
    pub name: String,
    pub provider: String,
    /// Context size in tokens; 0 when unknown.
    pub context_window: u32,
    /// Whether this model may invoke write-category actions at all.
    pub write_capable: bool,
}

impl ModelProfile {
    /// Compact context-size label: `200K`, `1M`, or empty when unknown.
    pub fn context_badge(&self) -> String {
        match self.context_window {
            0 => String::new(),
            n if n >= 1_000_000 && n % 1_000_000 == 0 => format!("{}M", n / 1_000_000),
            n if n >= 1_000_000 => format!("{:.1}M", f64::from(n) / 1_000_000.0),
            n if n >= 1_000 => format!("{}K", n / 1_000),
            n => n.to_string(),
        }
    }
}

impl fmt::Display for ModelProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.provider)?;
        let badge = self.context_badge();
        if !badge.is_empty() {
            write!(f, " [{badge}]")?;
        }
        Ok(())
    }
}

/// The configured set of selectable models.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    profiles: Vec<ModelProfile>,
    default_index: usize,
}

impl ModelCatalog {
    pub fn new(profiles: Vec<ModelProfile>, default_id: &str) -> Result<Self, ConfigError> {
        let default_index = profiles
            .iter()
            .position(|p| p.id == default_id)
            .ok_or_else(|| ConfigError::UnknownDefaultModel {
                model: default_id.to_string(),
            })?;
        Ok(Self {
            profiles,
            default_index,
        })
    }

    pub fn get(&self, id: &str) -> Option<&ModelProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn default_profile(&self) -> &ModelProfile {
        &self.profiles[self.default_index]
    }

    pub fn profiles(&self) -> &[ModelProfile] {
        &self.profiles
    }
}

// ── Backend contract ─────────────────────────────────────────────────────

/// A tool call the model proposed, before lookup or validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallProposal {
    /// Backend-assigned call id, echoed back with the result.
    pub id: String,
    /// `skill__action` function name.
    pub name: String,
    /// Raw JSON argument text.
    pub arguments: String,
}

/// One item of a model stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelEvent {
    Token(String),
    ToolCall(ToolCallProposal),
}

pub type ModelStream = BoxStream<'static, Result<ModelEvent, BackendError>>;

/// Everything a backend needs for one turn.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: ModelProfile,
    pub system_prompt: String,
    pub history: Vec<Turn>,
    /// OpenAI function tool definitions.
    pub tools: Vec<Value>,
}

/// The model inference collaborator.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Start a turn. Connection failures surface here; failures after the
    /// first event surface as stream items.
    async fn generate(&self, request: GenerateRequest) -> Result<ModelStream, BackendError>;

    fn name(&self) -> &str;
}
