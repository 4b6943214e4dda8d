//! A backend that replays canned replies in order.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;

use super::{BackendError, GenerateRequest, ModelBackend, ModelEvent, ModelStream, ToolCallProposal};

#[derive(Debug, Clone)]
enum Step {
    Token(String),
    ToolCall(ToolCallProposal),
    Fail(String),
    Hang,
}

/// One scripted model turn.
#[derive(Debug, Clone, Default)]
pub struct ScriptedReply {
    steps: Vec<Step>,
    token_delay: Duration,
    refuse: Option<String>,
}

impl ScriptedReply {
    /// Reply with text, streamed word by word.
    pub fn text(text: &str) -> Self {
        let steps = text
            .split_inclusive(' ')
            .map(|w| Step::Token(w.to_string()))
            .collect();
        Self {
            steps,
            ..Self::default()
        }
    }

    /// Reply with a single tool call.
    pub fn tool_call(name: &str, arguments: serde_json::Value) -> Self {
        Self {
            steps: vec![Step::ToolCall(ToolCallProposal {
                id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                name: name.into(),
                arguments: arguments.to_string(),
            })],
            ..Self::default()
        }
    }

    /// Fail the `generate` call itself.
    pub fn unavailable(message: &str) -> Self {
        Self {
            refuse: Some(message.into()),
            ..Self::default()
        }
    }

    /// Prepend text before whatever else the reply does.
    pub fn preceded_by(mut self, text: &str) -> Self {
        let mut steps: Vec<Step> = text
            .split_inclusive(' ')
            .map(|w| Step::Token(w.to_string()))
            .collect();
        steps.append(&mut self.steps);
        self.steps = steps;
        self
    }

    /// Fail mid-stream after the steps so far.
    pub fn then_fail(mut self, message: &str) -> Self {
        self.steps.push(Step::Fail(message.into()));
        self
    }

    /// Never finish after the steps so far.
    pub fn then_hang(mut self) -> Self {
        self.steps.push(Step::Hang);
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }
}

/// Replays [`ScriptedReply`]s, one per `generate` call. Once the script runs
/// out every turn answers with `fallback` text.
#[derive(Debug)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<GenerateRequest>>,
    fallback: String,
}

impl ScriptedBackend {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            fallback: "Done.".into(),
        }
    }

    pub fn with_fallback(mut self, text: &str) -> Self {
        self.fallback = text.into();
        self
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
    }

    /// Requests seen so far, oldest first.
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<ModelStream, BackendError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let reply = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| ScriptedReply::text(&self.fallback));

        if let Some(message) = reply.refuse {
            return Err(BackendError::Unavailable { message });
        }

        let delay = reply.token_delay;
        let steps: VecDeque<Step> = reply.steps.into();
        let stream = futures_util::stream::unfold(steps, move |mut steps| async move {
            let step = steps.pop_front()?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let item = match step {
                Step::Token(t) => Ok(ModelEvent::Token(t)),
                Step::ToolCall(call) => Ok(ModelEvent::ToolCall(call)),
                Step::Fail(message) => Err(BackendError::Unavailable { message }),
                Step::Hang => {
                    futures_util::future::pending::<()>().await;
                    return None;
                }
            };
            Some((item, steps))
        });
        Ok(stream.boxed())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelProfile;

    fn request() -> GenerateRequest {
        GenerateRequest {
            model: ModelProfile {
                id: "m".into(),
                name: "m".into(),
                provider: "p".into(),
                context_window: 0,
                write_capable: false,
            },
            system_prompt: String::new(),
            history: Vec::new(),
            tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn replays_in_order_then_falls_back() {
        let backend = ScriptedBackend::new([
            ScriptedReply::text("hello there"),
            ScriptedReply::tool_call("docker__ps", serde_json::json!({})),
        ]);

        let events: Vec<_> = backend.generate(request()).await.unwrap().collect().await;
        let text: String = events
            .into_iter()
            .map(|e| match e.unwrap() {
                ModelEvent::Token(t) => t,
                ModelEvent::ToolCall(_) => panic!("unexpected tool call"),
            })
            .collect();
        assert_eq!(text, "hello there");

        let events: Vec<_> = backend.generate(request()).await.unwrap().collect().await;
        assert!(matches!(&events[0], Ok(ModelEvent::ToolCall(c)) if c.name == "docker__ps"));

        let events: Vec<_> = backend.generate(request()).await.unwrap().collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(backend.requests().len(), 3);
    }

    #[tokio::test]
    async fn unavailable_fails_generate() {
        let backend = ScriptedBackend::new([ScriptedReply::unavailable("down")]);
        assert!(matches!(
            backend.generate(request()).await,
            Err(BackendError::Unavailable { .. })
        ));
    }
}
