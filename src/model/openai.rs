//! Streaming client for OpenAI-compatible chat completion endpoints.
//!
//! Requests are sent with `stream: true`; the response is server-sent events,
//! one `data: {json}` line per chunk and `data: [DONE]` at the end. Content
//! deltas become [`ModelEvent::Token`]s. Tool-call deltas arrive in fragments
//! keyed by index and are accumulated until the stream ends, then emitted as
//! a single [`ModelEvent::ToolCall`].

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::{Value, json};

use crate::config::BackendConfig;
use crate::session::{Turn, TurnRole};

use super::{BackendError, GenerateRequest, ModelBackend, ModelEvent, ModelStream, ToolCallProposal};

/// OpenAI-compatible streaming backend.
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.url.clone(),
            api_key: std::env::var(&config.api_key_env).ok(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    fn body(&self, request: &GenerateRequest) -> Value {
        let mut messages = vec![json!({"role": "system", "content": request.system_prompt})];
        messages.extend(request.history.iter().map(turn_to_message));

        let mut body = json!({
            "model": request.model.id,
            "messages": messages,
            "stream": true,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.clone());
            body["tool_choice"] = Value::String("auto".into());
        }
        body
    }
}

/// Map a conversation turn to a chat completion message.
fn turn_to_message(turn: &Turn) -> Value {
    match turn.role {
        TurnRole::User => json!({"role": "user", "content": turn.content}),
        TurnRole::Agent => match &turn.call {
            Some(call) => json!({
                "role": "assistant",
                "content": if turn.content.is_empty() { Value::Null } else { Value::String(turn.content.clone()) },
                "tool_calls": [{
                    "id": call.id,
                    "type": "function",
                    "function": {"name": call.tool, "arguments": call.arguments},
                }],
            }),
            None => json!({"role": "assistant", "content": turn.content}),
        },
        TurnRole::SkillResult => match &turn.call {
            Some(call) => json!({"role": "tool", "tool_call_id": call.id, "content": turn.content}),
            None => json!({"role": "user", "content": format!("[skill result]\n{}", turn.content)}),
        },
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<ModelStream, BackendError> {
        let mut http = self.client.post(&self.url).json(&self.body(&request));
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let response = http.send().await.map_err(|e| BackendError::Unavailable {
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message: String = text.chars().take(300).collect();
            return Err(BackendError::RequestFailed {
                status: status.as_u16(),
                message,
            });
        }

        tracing::debug!(model = request.model.id.as_str(), "model stream opened");
        let bytes = response
            .bytes_stream()
            .map(|chunk| {
                chunk.map(|b| b.to_vec()).map_err(|e| BackendError::Unavailable {
                    message: e.to_string(),
                })
            })
            .boxed();
        Ok(sse_events(bytes))
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

// ── SSE decoding ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates chunk deltas across a stream.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: String,
    calls: BTreeMap<u64, PartialCall>,
    done: bool,
}

impl SseDecoder {
    /// Feed raw bytes; returns token events completed by them.
    fn feed(&mut self, bytes: &[u8]) -> Result<Vec<ModelEvent>, BackendError> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            if let Some(event) = self.line(line.trim())? {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn line(&mut self, line: &str) -> Result<Option<ModelEvent>, BackendError> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim();
        if data == "[DONE]" {
            self.done = true;
            return Ok(None);
        }
        if data.is_empty() || self.done {
            return Ok(None);
        }

        let chunk: Value = serde_json::from_str(data).map_err(|e| BackendError::Parse {
            message: e.to_string(),
        })?;
        if let Some(err) = chunk.get("error") {
            return Err(BackendError::Unavailable {
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("stream error")
                    .to_string(),
            });
        }

        let Some(delta) = chunk.pointer("/choices/0/delta") else {
            return Ok(None);
        };

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
                let partial = self.calls.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    partial.id = id.to_string();
                }
                if let Some(name) = call.pointer("/function/name").and_then(Value::as_str) {
                    partial.name.push_str(name);
                }
                if let Some(args) = call.pointer("/function/arguments").and_then(Value::as_str) {
                    partial.arguments.push_str(args);
                }
            }
        }

        Ok(delta
            .get("content")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(|c| ModelEvent::Token(c.to_string())))
    }

    /// The first accumulated tool call, if any. Extra calls are dropped: a
    /// session handles one proposal per step.
    fn finish(&mut self) -> Option<ModelEvent> {
        let mut calls = std::mem::take(&mut self.calls).into_values();
        let first = calls.next()?;
        let dropped = calls.count();
        if dropped > 0 {
            tracing::warn!(dropped, "model proposed several tool calls, keeping the first");
        }
        let id = if first.id.is_empty() {
            format!("call_{}", uuid::Uuid::new_v4().simple())
        } else {
            first.id
        };
        Some(ModelEvent::ToolCall(ToolCallProposal {
            id,
            name: first.name,
            arguments: first.arguments,
        }))
    }
}

struct SseState {
    bytes: BoxStream<'static, Result<Vec<u8>, BackendError>>,
    decoder: SseDecoder,
    pending: VecDeque<ModelEvent>,
    finished: bool,
}

fn sse_events(bytes: BoxStream<'static, Result<Vec<u8>, BackendError>>) -> ModelStream {
    let state = SseState {
        bytes,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };
    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => match state.decoder.feed(&chunk) {
                    Ok(events) => state.pending.extend(events),
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                },
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.finished = true;
                    let tail = std::mem::take(&mut state.decoder.buffer);
                    match state.decoder.line(tail.trim()) {
                        Ok(event) => state.pending.extend(event),
                        Err(e) => return Some((Err(e), state)),
                    }
                    state.pending.extend(state.decoder.finish());
                }
            }
        }
    })
    .boxed()
}
