//! Agent-to-agent (A2A) surface: an agent card for discovery and a JSON-RPC
//! `tasks/send` method.
//!
//! A task is one user message played through an ordinary [`Connection`], so
//! it meets the same policy gate, executor and audit sink as a chat client.
//! Nobody is on the other end to answer a confirmation prompt: prompts are
//! declined (audited as rejected) and the task reports `input-required`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::manager::{Connection, SessionManager};
use super::protocol::{Inbound, Outbound, OutboundFrame};
use crate::skills::Registry;

/// JSON-RPC error codes.
pub mod rpc_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
}

// ── Agent card ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub url: String,
    pub version: String,
    pub capabilities: AgentCapabilities,
    pub default_input_modes: Vec<String>,
    pub default_output_modes: Vec<String>,
    pub skills: Vec<AgentSkill>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    pub streaming: bool,
    pub push_notifications: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSkill {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
}

impl AgentCard {
    /// Describe the loaded skills. `base_url` is where `/a2a` is served.
    pub fn build(name: &str, registry: &Registry, base_url: &str) -> Self {
        let skills = registry
            .skills()
            .map(|skill| AgentSkill {
                id: skill.name.clone(),
                name: skill.name.clone(),
                description: skill.description.clone(),
                tags: skill
                    .actions
                    .iter()
                    .map(|a| a.tool_name())
                    .collect(),
            })
            .collect();
        Self {
            name: name.to_string(),
            description: format!("{name}: command agent for the infrastructure its skills cover"),
            url: format!("{}/a2a", base_url.trim_end_matches('/')),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: AgentCapabilities::default(),
            default_input_modes: vec!["text".into()],
            default_output_modes: vec!["text".into()],
            skills,
        }
    }
}

// ── JSON-RPC envelope ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Value,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcResponse {
    fn result(id: Value, task: Task) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(task),
            error: None,
        }
    }

    fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

// ── Tasks ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Completed,
    InputRequired,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Part {
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub session_id: String,
    pub status: TaskStatus,
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Deserialize)]
struct SendParams {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    message: Option<Value>,
}

/// Text of an A2A message: its text parts joined, or a bare `content`.
fn message_text(message: &Value) -> String {
    let mut text = String::new();
    if let Some(parts) = message.get("parts").and_then(Value::as_array) {
        for part in parts {
            match part {
                Value::String(s) => text.push_str(s),
                Value::Object(o) if o.get("type").and_then(Value::as_str) == Some("text") => {
                    if let Some(s) = o.get("text").and_then(Value::as_str) {
                        text.push_str(s);
                    }
                }
                _ => {}
            }
        }
    }
    if text.trim().is_empty() {
        if let Some(s) = message.get("content").and_then(Value::as_str) {
            text.push_str(s);
        }
    }
    text.trim().to_string()
}

/// Answer one JSON-RPC request body on behalf of `user_id`.
pub async fn handle(manager: &Arc<SessionManager>, user_id: &str, body: &str) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => return RpcResponse::error(Value::Null, rpc_codes::PARSE_ERROR, format!("parse error: {e}")),
    };
    if request.jsonrpc.as_deref() != Some("2.0") {
        return RpcResponse::error(request.id, rpc_codes::INVALID_REQUEST, "jsonrpc must be \"2.0\"");
    }
    let Some(method) = request.method else {
        return RpcResponse::error(request.id, rpc_codes::INVALID_REQUEST, "missing method");
    };

    match method.as_str() {
        "tasks/send" => {
            let params: SendParams = match serde_json::from_value(request.params) {
                Ok(p) => p,
                Err(e) => return RpcResponse::error(request.id, rpc_codes::INVALID_PARAMS, e.to_string()),
            };
            let text = params.message.as_ref().map(message_text).unwrap_or_default();
            if text.is_empty() {
                return RpcResponse::error(request.id, rpc_codes::INVALID_PARAMS, "no text content in message");
            }
            let task_id = params.id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let task = run_task(manager, user_id, task_id, text).await;
            RpcResponse::result(request.id, task)
        }
        other => {
            tracing::debug!(method = other, "a2a method not supported");
            RpcResponse::error(request.id, rpc_codes::METHOD_NOT_FOUND, format!("method not found: {other}"))
        }
    }
}

/// Play one message through a fresh session and collect what it produced.
async fn run_task(manager: &Arc<SessionManager>, user_id: &str, task_id: String, text: String) -> Task {
    let config = &manager.services().config;
    let deadline = Duration::from_secs(
        config
            .model_turn_timeout_seconds
            .saturating_mul(u64::from(config.max_tool_rounds) + 1),
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let mut connection = Connection::open(Arc::clone(manager), user_id, None, tx).await;
    let session_id = connection.session().id().to_string();
    tracing::info!(task_id = task_id.as_str(), session_id = session_id.as_str(), user_id, "a2a task started");

    connection.handle(Inbound::UserMessage { text }).await;

    let mut reply = String::new();
    let mut results = Vec::new();
    let mut status = TaskStatus {
        state: TaskState::Completed,
        message: None,
    };

    let collected = tokio::time::timeout(deadline, async {
        while let Some(frame) = rx.recv().await {
            if frame.session_id != session_id {
                continue;
            }
            match frame.event {
                Outbound::TokenDelta { text } => reply.push_str(&text),
                Outbound::SkillResult {
                    skill_name,
                    action,
                    success,
                    output,
                    ..
                } => {
                    let outcome = if success { "ok" } else { "failed" };
                    results.push(Artifact {
                        name: format!("{skill_name}.{action}"),
                        parts: vec![Part::Text {
                            text: format!("[{outcome}] {output}"),
                        }],
                    });
                }
                Outbound::ConfirmationRequired {
                    confirm_id,
                    skill_name,
                    action,
                    description,
                    ..
                } => {
                    status = TaskStatus {
                        state: TaskState::InputRequired,
                        message: Some(format!(
                            "{skill_name}.{action} needs an operator's confirmation: {description}"
                        )),
                    };
                    connection
                        .handle(Inbound::Confirm {
                            confirm_id,
                            approved: false,
                        })
                        .await;
                }
                Outbound::Error { message, terminal, .. } => {
                    if status.state != TaskState::InputRequired {
                        status = TaskStatus {
                            state: TaskState::Failed,
                            message: Some(message),
                        };
                    }
                    if terminal {
                        return;
                    }
                }
                Outbound::TurnComplete => return,
                _ => {}
            }
        }
        status = TaskStatus {
            state: TaskState::Failed,
            message: Some("session ended before the turn completed".into()),
        };
    })
    .await;

    if collected.is_err() {
        status = TaskStatus {
            state: TaskState::Failed,
            message: Some(format!("task did not finish within {}s", deadline.as_secs())),
        };
    }
    connection.close().await;
    tracing::info!(task_id = task_id.as_str(), session_id = session_id.as_str(), state = ?status.state, "a2a task finished");

    let mut artifacts = Vec::new();
    if !reply.is_empty() {
        artifacts.push(Artifact {
            name: "reply".into(),
            parts: vec![Part::Text { text: reply }],
        });
    }
    artifacts.extend(results);

    Task {
        id: task_id,
        session_id,
        status,
        artifacts,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn message_text_joins_text_parts() {
        let message = json!({
            "role": "user",
            "parts": [{"type": "text", "text": "list "}, "tables", {"type": "data", "data": {}}],
        });
        assert_eq!(message_text(&message), "list tables");
        assert_eq!(message_text(&json!({"content": " hi "})), "hi");
        assert_eq!(message_text(&json!({"parts": []})), "");
    }

    #[test]
    fn task_state_uses_protocol_names() {
        assert_eq!(serde_json::to_value(TaskState::InputRequired).unwrap(), "input-required");
        assert_eq!(
            serde_json::to_value(Part::Text { text: "x".into() }).unwrap(),
            json!({"type": "text", "text": "x"})
        );
    }
}
