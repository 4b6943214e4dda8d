//! Conversation turns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Agent,
    SkillResult,
}

/// The tool call a turn proposes or answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Backend call id.
    pub id: String,
    /// `skill__action`.
    pub tool: String,
    /// Raw JSON arguments as proposed.
    pub arguments: String,
}

/// One entry of a session's ordered log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<ToolCallRecord>,
    /// Set on skill-result turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

impl Turn {
    fn new(role: TurnRole, content: String) -> Self {
        Self {
            role,
            content,
            at: Utc::now(),
            call: None,
            success: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(TurnRole::User, text.into())
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self::new(TurnRole::Agent, text.into())
    }

    /// Agent turn that ends in a tool call proposal.
    pub fn agent_proposal(text: String, call: ToolCallRecord) -> Self {
        Self {
            call: Some(call),
            ..Self::new(TurnRole::Agent, text)
        }
    }

    /// Result of a proposed call: output, error text or refusal.
    pub fn skill_result(call: ToolCallRecord, success: bool, output: String) -> Self {
        Self {
            call: Some(call),
            success: Some(success),
            ..Self::new(TurnRole::SkillResult, output)
        }
    }
}

/// The most recent `window` turns, never starting on an orphaned skill
/// result whose proposal was cut off.
pub fn history_window(turns: &[Turn], window: usize) -> &[Turn] {
    let mut start = turns.len().saturating_sub(window);
    while start < turns.len() && turns[start].role == TurnRole::SkillResult {
        start += 1;
    }
    &turns[start..]
}
