//! JSON frames exchanged on a session connection.
//!
//! Frames are tagged by `type`. Every outbound frame also carries the
//! `session_id` it belongs to, so a connection that switches sessions can
//! discard frames from the one it left.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SessionError;
use crate::executor::ErrorKind;
use crate::model::ModelProfile;

/// Client → core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    UserMessage { text: String },
    Confirm { confirm_id: String, approved: bool },
    Cancel,
    SwitchModel { model_id: String },
    NewSession,
    Ping,
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        serde_json::from_str(text).map_err(|e| SessionError::MalformedFrame {
            message: e.to_string(),
        })
    }
}

/// Machine-readable `code` values of [`Outbound::Error`].
pub mod codes {
    pub const MALFORMED_FRAME: &str = "malformed_frame";
    pub const UNKNOWN_CONFIRMATION: &str = "unknown_confirmation";
    pub const STALE_CONFIRMATION: &str = "stale_confirmation";
    pub const UNKNOWN_MODEL: &str = "unknown_model";
    pub const BACKEND_UNAVAILABLE: &str = "backend_unavailable";
    pub const AUDIT_DROPPED: &str = "audit_dropped";
    pub const TOOL_ROUNDS_EXCEEDED: &str = "tool_rounds_exceeded";
    pub const SESSION_CLOSED: &str = "session_closed";
    pub const IDLE_TIMEOUT: &str = "idle_timeout";
}

/// Core → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    SessionStarted {
        model: ModelProfile,
        #[serde(default)]
        title: Option<String>,
        /// True when an existing session was resumed.
        #[serde(default)]
        resumed: bool,
    },
    TokenDelta {
        text: String,
    },
    SkillStart {
        skill_name: String,
        action: String,
    },
    SkillResult {
        skill_name: String,
        action: String,
        success: bool,
        output: String,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_kind: Option<ErrorKind>,
    },
    ConfirmationRequired {
        confirm_id: String,
        skill_name: String,
        action: String,
        description: String,
        /// Proposed parameters, sensitive values redacted.
        params: Map<String, Value>,
        expires_in_seconds: u64,
    },
    ModelSwitched {
        model: ModelProfile,
    },
    TurnComplete,
    Error {
        message: String,
        code: String,
        /// The session is closed after a terminal error.
        terminal: bool,
    },
    Pong,
}

impl Outbound {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: code.into(),
            terminal: false,
        }
    }

    pub fn terminal_error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: code.into(),
            terminal: true,
        }
    }
}

/// An outbound event addressed to its session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub session_id: String,
    #[serde(flatten)]
    pub event: Outbound,
}

impl OutboundFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({
                "type": "error",
                "session_id": self.session_id,
                "code": "internal",
                "message": e.to_string(),
                "terminal": false,
            })
            .to_string()
        })
    }
}
