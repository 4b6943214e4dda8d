//! One task per session.
//!
//! The actor owns every piece of mutable session state. Inbound frames arrive
//! on a command channel; model streams and executions run as child tasks that
//! report back on an internal channel, tagged with the generation or attempt
//! number they belong to so late reports from a cancelled step are ignored.
//!
//! ```text
//!  Idle ──user_message──▶ Streaming ──text only──▶ Idle
//!                            │
//!                        tool call ─▶ policy ─┬─ Deny ──────────────▶ Idle
//!                                             ├─ RequireConfirmation ─▶ AwaitingConfirmation
//!                                             └─ Allow ──▶ Executing ─▶ Streaming
//!  AwaitingConfirmation ─approve─▶ policy again ─▶ Executing
//!                       ─reject / expire / stale / cancel─▶ Idle
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::audit::AuditOutcome;
use crate::error::SessionError;
use crate::executor::{ErrorKind, ExecutionResult, ValidationError, validate};
use crate::model::{BackendError, GenerateRequest, ModelBackend, ModelEvent, ModelProfile, ToolCallProposal};
use crate::policy::{DenyReason, PolicyVerdict, VerdictKind};
use crate::prompt;
use crate::skills::{ActionDescriptor, BoundParams};

use super::attempt::{Attempt, SessionIdentity};
use super::confirmation::{ConfirmationSlot, PendingConfirmation, Resolution, RetiredConfirmations, Retirement};
use super::manager::SessionServices;
use super::protocol::{Inbound, Outbound, OutboundFrame, codes};
use super::store::SessionRecord;
use super::{ToolCallRecord, Turn, history_window};

/// Externally visible phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Streaming,
    AwaitingConfirmation,
    Executing,
    Closed,
}

#[derive(Debug)]
pub(crate) enum Command {
    Frame(Inbound),
    /// Redirect outbound frames to a new connection.
    Attach(mpsc::UnboundedSender<OutboundFrame>),
    Close(oneshot::Sender<()>),
}

/// Reports from child tasks.
#[derive(Debug)]
enum Internal {
    Model { generation: u64, event: ModelEvent },
    ModelFinished { generation: u64, result: Result<(), BackendError> },
    Executed { attempt: u64, result: ExecutionResult },
}

enum Phase {
    Idle,
    Streaming {
        generation: u64,
        cancel: CancellationToken,
        text: String,
        proposal: Option<ToolCallProposal>,
    },
    AwaitingConfirmation,
    Executing {
        attempt_no: u64,
        cancel: CancellationToken,
        cancel_requested: bool,
        attempt: Box<Attempt>,
    },
    Closed,
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Self::Idle => SessionState::Idle,
            Self::Streaming { .. } => SessionState::Streaming,
            Self::AwaitingConfirmation => SessionState::AwaitingConfirmation,
            Self::Executing { .. } => SessionState::Executing,
            Self::Closed => SessionState::Closed,
        }
    }
}

// ── Handle ───────────────────────────────────────────────────────────────

/// Cheap, cloneable address of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: String,
    user_id: String,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed() || self.state() == SessionState::Closed
    }

    pub async fn send(&self, frame: Inbound) -> Result<(), SessionError> {
        self.commands
            .send(Command::Frame(frame))
            .await
            .map_err(|_| self.closed_error())
    }

    pub(crate) async fn attach(&self, outbound: mpsc::UnboundedSender<OutboundFrame>) -> Result<(), SessionError> {
        self.commands
            .send(Command::Attach(outbound))
            .await
            .map_err(|_| self.closed_error())
    }

    /// Ask the session to close and wait until it has. An execution in
    /// flight is allowed to finish so its result is audited.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Close(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Wait until the session reaches `state`. Returns false if the session
    /// ended without reaching it.
    pub async fn wait_for(&self, state: SessionState) -> bool {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == state).await.is_ok()
    }

    fn closed_error(&self) -> SessionError {
        SessionError::Closed {
            session_id: self.id.clone(),
        }
    }
}

/// Start the actor for `record` and return its handle.
pub(crate) fn spawn(
    services: Arc<SessionServices>,
    record: SessionRecord,
    model: ModelProfile,
    resumed: bool,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
) -> SessionHandle {
    let (commands_tx, commands_rx) = mpsc::channel(64);
    let (state_tx, state_rx) = watch::channel(SessionState::Idle);
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();

    let handle = SessionHandle {
        id: record.id.clone(),
        user_id: record.user_id.clone(),
        commands: commands_tx,
        state: state_rx,
    };

    let actor = SessionActor {
        id: record.id,
        user_id: record.user_id,
        title: record.title,
        turns: record.turns,
        services,
        model,
        seq: 0,
        phase: Phase::Idle,
        confirmation: ConfirmationSlot::default(),
        retired: RetiredConfirmations::default(),
        queue: VecDeque::new(),
        tool_rounds: 0,
        backend_failures: 0,
        generation: 0,
        attempts: 0,
        closing: false,
        outbound,
        state: state_tx,
        internal: internal_tx,
    };
    tokio::spawn(actor.run(commands_rx, internal_rx, resumed));
    handle
}

// ── Actor ────────────────────────────────────────────────────────────────

struct SessionActor {
    id: String,
    user_id: String,
    title: Option<String>,
    turns: Vec<Turn>,
    services: Arc<SessionServices>,
    model: ModelProfile,
    /// Advances on every accepted user message.
    seq: u64,
    phase: Phase,
    confirmation: ConfirmationSlot,
    retired: RetiredConfirmations,
    /// Messages that arrived while a turn was in progress.
    queue: VecDeque<String>,
    /// Model/tool rounds since the last user message.
    tool_rounds: u32,
    /// Consecutive backend failures.
    backend_failures: u32,
    generation: u64,
    attempts: u64,
    closing: bool,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    state: watch::Sender<SessionState>,
    internal: mpsc::UnboundedSender<Internal>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        resumed: bool,
    ) {
        tracing::info!(
            session_id = self.id.as_str(),
            user_id = self.user_id.as_str(),
            model = self.model.id.as_str(),
            resumed,
            "session started"
        );
        self.emit(Outbound::SessionStarted {
            model: self.model.clone(),
            title: self.title.clone(),
            resumed,
        });

        let idle_ttl = self.services.config.idle_ttl();
        let mut acks = Vec::new();

        loop {
            if !self.closing {
                self.drain_queue().await;
            }
            match self.phase {
                Phase::Closed => break,
                Phase::Executing { .. } => {}
                _ if self.closing => break,
                _ => {}
            }

            let expiry = self.confirmation.pending().map(|p| p.expires_at);
            let idle = matches!(self.phase, Phase::Idle) && self.queue.is_empty();

            tokio::select! {
                command = commands.recv(), if !self.closing => match command {
                    Some(Command::Frame(frame)) => self.on_frame(frame).await,
                    Some(Command::Attach(outbound)) => self.on_attach(outbound),
                    Some(Command::Close(ack)) => {
                        acks.push(ack);
                        self.begin_close().await;
                    }
                    None => self.begin_close().await,
                },
                Some(event) = internal.recv() => self.on_internal(event).await,
                _ = tokio::time::sleep_until(expiry.unwrap_or_else(Instant::now)), if expiry.is_some() => {
                    self.on_expiry().await;
                }
                _ = tokio::time::sleep(idle_ttl), if idle && !self.closing => {
                    tracing::info!(session_id = self.id.as_str(), "session idle, closing");
                    self.emit(Outbound::terminal_error(
                        codes::IDLE_TIMEOUT,
                        format!("Session closed after {}s of inactivity.", idle_ttl.as_secs()),
                    ));
                    self.set_phase(Phase::Closed);
                }
            }
        }

        self.set_phase(Phase::Closed);
        tracing::info!(session_id = self.id.as_str(), turns = self.turns.len(), "session closed");
        for ack in acks {
            let _ = ack.send(());
        }
    }

    // ── Plumbing ─────────────────────────────────────────────────────────

    fn emit(&self, event: Outbound) {
        let frame = OutboundFrame {
            session_id: self.id.clone(),
            event,
        };
        if self.outbound.send(frame).is_err() {
            tracing::trace!(session_id = self.id.as_str(), "connection gone, frame dropped");
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        let state = phase.state();
        self.phase = phase;
        self.state.send_replace(state);
    }

    fn identity(&self) -> SessionIdentity<'_> {
        SessionIdentity {
            session_id: &self.id,
            user_id: &self.user_id,
            model_id: &self.model.id,
        }
    }

    async fn push_turn(&mut self, turn: Turn) {
        if let Err(e) = self.services.store.append_turn(&self.id, &turn).await {
            tracing::warn!(session_id = self.id.as_str(), error = %e, "failed to persist turn");
        }
        self.turns.push(turn);
    }

    /// Write the audit record for `attempt`. A dropped record is reported to
    /// the user before the outcome it belongs to.
    async fn record(&self, attempt: &Attempt, outcome: AuditOutcome, detail: Option<&str>, duration_ms: Option<u64>) {
        let entry = attempt.audit_entry(&self.identity(), outcome, detail, duration_ms);
        if let Err(e) = self.services.audit.record(entry).await {
            self.emit(Outbound::error(
                codes::AUDIT_DROPPED,
                format!(
                    "The audit record for {} ({outcome}) could not be written: {e}",
                    attempt.qualified_name()
                ),
            ));
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    async fn on_frame(&mut self, frame: Inbound) {
        match frame {
            Inbound::UserMessage { text } => self.on_user_message(text).await,
            Inbound::Confirm { confirm_id, approved } => self.on_confirm(&confirm_id, approved).await,
            Inbound::Cancel => self.on_cancel().await,
            Inbound::SwitchModel { model_id } => self.on_switch_model(&model_id).await,
            Inbound::Ping => self.emit(Outbound::Pong),
            Inbound::NewSession => {
                tracing::debug!(session_id = self.id.as_str(), "new_session reached the session, ignoring");
            }
        }
    }

    fn on_attach(&mut self, outbound: mpsc::UnboundedSender<OutboundFrame>) {
        tracing::info!(session_id = self.id.as_str(), "connection attached");
        self.outbound = outbound;
        self.emit(Outbound::SessionStarted {
            model: self.model.clone(),
            title: self.title.clone(),
            resumed: true,
        });
        if let Some(pending) = self.confirmation.pending() {
            let remaining = pending.expires_at.saturating_duration_since(Instant::now());
            self.emit(confirmation_frame(pending, remaining));
        }
    }

    async fn on_user_message(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        match self.phase {
            Phase::Streaming { .. } | Phase::Executing { .. } => {
                tracing::debug!(session_id = self.id.as_str(), queued = self.queue.len() + 1, "message queued");
                self.queue.push_back(text);
                return;
            }
            Phase::AwaitingConfirmation => self.supersede_pending().await,
            Phase::Closed => return,
            Phase::Idle => {}
        }
        self.accept_message(text).await;
    }

    /// Feed the next queued message. A message queued while the turn was
    /// running also supersedes a confirmation that turn ends up requesting.
    async fn drain_queue(&mut self) {
        if matches!(self.phase, Phase::Idle | Phase::AwaitingConfirmation) {
            if let Some(text) = self.queue.pop_front() {
                self.on_user_message(text).await;
            }
        }
    }

    async fn accept_message(&mut self, text: String) {
        self.seq += 1;
        self.tool_rounds = 0;
        if self.title.is_none() {
            let title = make_title(&text, self.services.config.title_max_chars);
            if let Err(e) = self.services.store.set_title(&self.id, &title).await {
                tracing::warn!(session_id = self.id.as_str(), error = %e, "failed to persist title");
            }
            self.title = Some(title);
        }
        self.push_turn(Turn::user(text)).await;
        self.start_model_turn();
    }

    async fn on_cancel(&mut self) {
        self.queue.clear();
        match &mut self.phase {
            Phase::Idle | Phase::Closed => {}
            Phase::Streaming { cancel, .. } => {
                cancel.cancel();
                tracing::info!(session_id = self.id.as_str(), "model turn cancelled");
                self.emit(Outbound::TurnComplete);
                self.set_phase(Phase::Idle);
            }
            Phase::AwaitingConfirmation => {
                if let Some(pending) = self.confirmation.take() {
                    self.retired.retire(&pending.confirm_id, Retirement::Cancelled);
                    self.refuse(&pending.attempt, AuditOutcome::Cancelled, "cancelled by the user")
                        .await;
                } else {
                    self.set_phase(Phase::Idle);
                }
            }
            Phase::Executing {
                cancel,
                cancel_requested,
                ..
            } => {
                // The capability decides how fast it stops; its result is
                // still audited and shown.
                cancel.cancel();
                *cancel_requested = true;
                tracing::info!(session_id = self.id.as_str(), "cancellation requested for running action");
            }
        }
    }

    async fn on_switch_model(&mut self, model_id: &str) {
        let Some(profile) = self.services.catalog.get(model_id).cloned() else {
            let error = SessionError::UnknownModel {
                model_id: model_id.to_string(),
            };
            self.emit(Outbound::error(codes::UNKNOWN_MODEL, error.to_string()));
            return;
        };
        if let Err(e) = self.services.store.set_model(&self.id, &profile.id).await {
            tracing::warn!(session_id = self.id.as_str(), error = %e, "failed to persist model switch");
        }
        tracing::info!(
            session_id = self.id.as_str(),
            from = self.model.id.as_str(),
            to = profile.id.as_str(),
            write_capable = profile.write_capable,
            "model switched"
        );
        self.model = profile.clone();
        self.emit(Outbound::ModelSwitched { model: profile });
    }

    async fn begin_close(&mut self) {
        self.closing = true;
        self.queue.clear();
        match &mut self.phase {
            Phase::Streaming { cancel, .. } => {
                cancel.cancel();
                self.set_phase(Phase::Idle);
            }
            Phase::AwaitingConfirmation => {
                if let Some(pending) = self.confirmation.take() {
                    self.retired.retire(&pending.confirm_id, Retirement::Cancelled);
                    self.record(&pending.attempt, AuditOutcome::Cancelled, Some("session closed"), None)
                        .await;
                }
                self.set_phase(Phase::Idle);
            }
            Phase::Executing {
                cancel,
                cancel_requested,
                ..
            } => {
                cancel.cancel();
                *cancel_requested = true;
                tracing::info!(session_id = self.id.as_str(), "closing, waiting for running action");
            }
            Phase::Idle | Phase::Closed => {}
        }
    }

    // ── Model turns ──────────────────────────────────────────────────────

    fn start_model_turn(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let registry = self.services.registry.snapshot();
        let request = GenerateRequest {
            model: self.model.clone(),
            system_prompt: prompt::system_prompt(&registry, &self.model),
            history: history_window(&self.turns, self.services.config.history_window).to_vec(),
            tools: registry.tool_definitions(),
        };
        let cancel = CancellationToken::new();
        tokio::spawn(stream_model_turn(
            self.services.backend.clone(),
            request,
            generation,
            self.services.config.model_turn_timeout(),
            cancel.clone(),
            self.internal.clone(),
        ));
        tracing::debug!(session_id = self.id.as_str(), generation, "model turn started");
        self.set_phase(Phase::Streaming {
            generation,
            cancel,
            text: String::new(),
            proposal: None,
        });
    }

    async fn on_internal(&mut self, event: Internal) {
        match event {
            Internal::Model { generation, event } => self.on_model_event(generation, event),
            Internal::ModelFinished { generation, result } => {
                let current = matches!(self.phase, Phase::Streaming { generation: g, .. } if g == generation);
                if !current {
                    return;
                }
                let Phase::Streaming { text, proposal, .. } = std::mem::replace(&mut self.phase, Phase::Idle) else {
                    return;
                };
                match result {
                    Ok(()) => {
                        self.backend_failures = 0;
                        match proposal {
                            Some(proposal) => self.on_proposal(text, proposal).await,
                            None => {
                                if !text.is_empty() {
                                    self.push_turn(Turn::agent(text)).await;
                                }
                                self.emit(Outbound::TurnComplete);
                                self.set_phase(Phase::Idle);
                            }
                        }
                    }
                    Err(e) => self.on_backend_failure(e),
                }
            }
            Internal::Executed { attempt, result } => {
                let current = matches!(self.phase, Phase::Executing { attempt_no, .. } if attempt_no == attempt);
                if !current {
                    return;
                }
                let Phase::Executing {
                    attempt,
                    cancel_requested,
                    ..
                } = std::mem::replace(&mut self.phase, Phase::Idle)
                else {
                    return;
                };
                self.on_executed(*attempt, cancel_requested, result).await;
            }
        }
    }

    fn on_model_event(&mut self, generation: u64, event: ModelEvent) {
        let Phase::Streaming {
            generation: current,
            text,
            proposal,
            ..
        } = &mut self.phase
        else {
            return;
        };
        if *current != generation {
            return;
        }
        match event {
            ModelEvent::Token(delta) => {
                text.push_str(&delta);
                self.emit(Outbound::TokenDelta { text: delta });
            }
            ModelEvent::ToolCall(call) => {
                if proposal.is_none() {
                    *proposal = Some(call);
                } else {
                    tracing::warn!(session_id = self.id.as_str(), tool = call.name.as_str(), "extra tool call ignored");
                }
            }
        }
    }

    fn on_backend_failure(&mut self, error: BackendError) {
        self.backend_failures += 1;
        let budget = self.services.config.backend_retry_budget.max(1);
        if self.backend_failures >= budget {
            tracing::error!(
                session_id = self.id.as_str(),
                failures = self.backend_failures,
                error = %error,
                "model backend retry budget exhausted, closing session"
            );
            self.emit(Outbound::terminal_error(
                codes::BACKEND_UNAVAILABLE,
                format!(
                    "{error}. Gave up after {} consecutive failures; start a new session.",
                    self.backend_failures
                ),
            ));
            self.set_phase(Phase::Closed);
        } else {
            tracing::warn!(
                session_id = self.id.as_str(),
                failures = self.backend_failures,
                error = %error,
                "model backend failure"
            );
            self.emit(Outbound::error(
                codes::BACKEND_UNAVAILABLE,
                format!("{error}. Please try again."),
            ));
            self.emit(Outbound::TurnComplete);
            self.set_phase(Phase::Idle);
        }
    }

    // ── Proposals ────────────────────────────────────────────────────────

    async fn on_proposal(&mut self, text: String, proposal: ToolCallProposal) {
        let max_rounds = self.services.config.max_tool_rounds;
        if self.tool_rounds >= max_rounds {
            tracing::warn!(session_id = self.id.as_str(), max_rounds, "tool round limit reached");
            if !text.is_empty() {
                self.push_turn(Turn::agent(text)).await;
            }
            let notice = format!("Stopped after {max_rounds} consecutive skill calls. Send a new message to continue.");
            self.push_turn(Turn::agent(notice.clone())).await;
            self.emit(Outbound::error(codes::TOOL_ROUNDS_EXCEEDED, notice));
            self.emit(Outbound::TurnComplete);
            self.set_phase(Phase::Idle);
            return;
        }
        self.tool_rounds += 1;

        let call = ToolCallRecord {
            id: proposal.id,
            tool: proposal.name,
            arguments: proposal.arguments,
        };
        self.push_turn(Turn::agent_proposal(text, call.clone())).await;

        let descriptor = self.services.registry.snapshot().lookup_tool(&call.tool);
        let params = match BoundParams::parse(&call.arguments) {
            Ok(params) => params,
            Err(e) => {
                let mut attempt = Attempt::new(call, descriptor, BoundParams::default());
                attempt.set_verdict(&PolicyVerdict::Deny(DenyReason::Unclassifiable {
                    detail: "tool call arguments are not a JSON object".into(),
                }));
                self.fail_validation(attempt, e).await;
                return;
            }
        };
        let mut attempt = Attempt::new(call, descriptor.clone(), params);

        let Some(action) = descriptor else {
            let reason = DenyReason::UnknownAction {
                tool: attempt.call.tool.clone(),
            };
            attempt.set_verdict(&PolicyVerdict::Deny(reason.clone()));
            self.deny(attempt, &reason).await;
            return;
        };

        let verdict = self
            .services
            .policy
            .evaluate(&action, &self.model, &attempt.params);
        tracing::debug!(
            session_id = self.id.as_str(),
            action = attempt.qualified_name().as_str(),
            model = self.model.id.as_str(),
            verdict = %verdict,
            "policy verdict"
        );
        attempt.set_verdict(&verdict);

        match verdict {
            PolicyVerdict::Deny(reason) => self.deny(attempt, &reason).await,
            PolicyVerdict::RequireConfirmation { description } => {
                self.request_confirmation(attempt, &action, description).await
            }
            PolicyVerdict::Allow => self.start_execution(attempt, action),
        }
    }

    async fn request_confirmation(&mut self, attempt: Attempt, action: &ActionDescriptor, description: String) {
        // Ask only about calls that could actually run.
        if let Err(e) = validate(action, &attempt.params) {
            self.fail_validation(attempt, e).await;
            return;
        }
        if let Some(displaced) = self.confirmation.take() {
            self.retired.retire(&displaced.confirm_id, Retirement::Superseded);
            self.record(&displaced.attempt, AuditOutcome::Superseded, Some("replaced by a newer proposal"), None)
                .await;
        }

        let window = self.services.config.confirmation_expiry();
        let pending = PendingConfirmation::new(self.seq, attempt, description, Instant::now() + window);
        tracing::info!(
            session_id = self.id.as_str(),
            confirm_id = pending.confirm_id.as_str(),
            action = pending.attempt.qualified_name().as_str(),
            "confirmation requested"
        );
        self.emit(confirmation_frame(&pending, window));
        self.confirmation.replace(pending);
        self.set_phase(Phase::AwaitingConfirmation);
    }

    async fn on_confirm(&mut self, confirm_id: &str, approved: bool) {
        match self.confirmation.resolve(confirm_id, approved, Instant::now(), self.seq) {
            Resolution::Unknown => {
                let (code, message) = match self.retired.get(confirm_id) {
                    Some(why) => (
                        codes::STALE_CONFIRMATION,
                        format!("Confirmation {confirm_id} {}.", why.describe()),
                    ),
                    None => (
                        codes::UNKNOWN_CONFIRMATION,
                        format!("No pending confirmation {confirm_id}."),
                    ),
                };
                tracing::warn!(session_id = self.id.as_str(), confirm_id, "confirm for no pending confirmation");
                self.emit(Outbound::error(code, message));
            }
            Resolution::Stale(pending) => {
                self.retired.retire(&pending.confirm_id, Retirement::Answered);
                tracing::warn!(session_id = self.id.as_str(), confirm_id, "stale confirmation refused");
                self.refuse(&pending.attempt, AuditOutcome::Stale, "the confirmation is stale")
                    .await;
            }
            Resolution::Expired(pending) => {
                self.retired.retire(&pending.confirm_id, Retirement::Expired);
                tracing::warn!(session_id = self.id.as_str(), confirm_id, "confirmation arrived after expiry");
                self.refuse(&pending.attempt, AuditOutcome::Expired, "the confirmation expired")
                    .await;
            }
            Resolution::Rejected(pending) => {
                self.retired.retire(&pending.confirm_id, Retirement::Answered);
                tracing::info!(session_id = self.id.as_str(), confirm_id, "confirmation rejected");
                self.refuse(&pending.attempt, AuditOutcome::Rejected, "rejected by the user")
                    .await;
            }
            Resolution::Approved(pending) => {
                self.retired.retire(&pending.confirm_id, Retirement::Answered);
                self.on_approved(pending).await;
            }
        }
    }

    /// Approval is necessary but not sufficient: the verdict is recomputed
    /// against the current model and registry.
    async fn on_approved(&mut self, pending: PendingConfirmation) {
        let mut attempt = pending.attempt;
        let Some(action) = self.services.registry.snapshot().lookup_tool(&attempt.call.tool) else {
            let reason = DenyReason::UnknownAction {
                tool: attempt.call.tool.clone(),
            };
            attempt.set_verdict(&PolicyVerdict::Deny(reason.clone()));
            self.deny(attempt, &reason).await;
            return;
        };
        attempt.descriptor = Some(action.clone());

        match self
            .services
            .policy
            .evaluate(&action, &self.model, &attempt.params)
        {
            PolicyVerdict::Deny(reason) => {
                attempt.set_verdict(&PolicyVerdict::Deny(reason.clone()));
                self.deny(attempt, &reason).await;
            }
            _ => {
                attempt.verdict = VerdictKind::RequireConfirmation;
                attempt.deny_reason = None;
                tracing::info!(
                    session_id = self.id.as_str(),
                    confirm_id = pending.confirm_id.as_str(),
                    action = attempt.qualified_name().as_str(),
                    "confirmation approved"
                );
                self.start_execution(attempt, action);
            }
        }
    }

    async fn on_expiry(&mut self) {
        let Some(pending) = self.confirmation.take_expired(Instant::now()) else {
            return;
        };
        self.retired.retire(&pending.confirm_id, Retirement::Expired);
        tracing::warn!(
            session_id = self.id.as_str(),
            confirm_id = pending.confirm_id.as_str(),
            "confirmation expired"
        );
        self.refuse(&pending.attempt, AuditOutcome::Expired, "the confirmation expired")
            .await;
    }

    async fn supersede_pending(&mut self) {
        if let Some(pending) = self.confirmation.take() {
            self.retired.retire(&pending.confirm_id, Retirement::Superseded);
            tracing::info!(
                session_id = self.id.as_str(),
                confirm_id = pending.confirm_id.as_str(),
                "confirmation superseded by a new message"
            );
            self.conclude_unexecuted(
                &pending.attempt,
                AuditOutcome::Superseded,
                "superseded by a newer message",
            )
            .await;
        }
        self.set_phase(Phase::Idle);
    }

    // ── Outcomes ─────────────────────────────────────────────────────────

    /// Audit an attempt that will not run and report it as a failed result.
    async fn conclude_unexecuted(&mut self, attempt: &Attempt, outcome: AuditOutcome, reason: &str) {
        self.record(attempt, outcome, Some(reason), None).await;
        let output = format!("Not executed: {reason}.");
        self.emit(Outbound::SkillResult {
            skill_name: attempt.skill.clone(),
            action: attempt.action.clone(),
            success: false,
            output: output.clone(),
            duration_ms: 0,
            error_kind: None,
        });
        self.push_turn(Turn::skill_result(attempt.call.clone(), false, output))
            .await;
    }

    /// Conclude without running, append a refusal turn and go idle.
    async fn refuse(&mut self, attempt: &Attempt, outcome: AuditOutcome, reason: &str) {
        self.conclude_unexecuted(attempt, outcome, reason).await;
        let refusal = format!("I did not run {}: {reason}.", attempt.qualified_name());
        self.emit(Outbound::TokenDelta {
            text: refusal.clone(),
        });
        self.push_turn(Turn::agent(refusal)).await;
        self.emit(Outbound::TurnComplete);
        self.set_phase(Phase::Idle);
    }

    async fn deny(&mut self, attempt: Attempt, reason: &DenyReason) {
        tracing::warn!(
            session_id = self.id.as_str(),
            action = attempt.qualified_name().as_str(),
            model = self.model.id.as_str(),
            reason = %reason,
            "action denied"
        );
        self.refuse(&attempt, AuditOutcome::Denied, &format!("denied, {reason}"))
            .await;
    }

    /// Parameters failed validation: nothing ran. The model gets the error
    /// and another round to correct itself.
    async fn fail_validation(&mut self, attempt: Attempt, error: ValidationError) {
        let message = error.to_string();
        tracing::info!(
            session_id = self.id.as_str(),
            action = attempt.qualified_name().as_str(),
            error = message.as_str(),
            "proposal failed validation"
        );
        self.record(&attempt, AuditOutcome::ValidationFailed, Some(&message), Some(0))
            .await;
        self.emit(Outbound::SkillResult {
            skill_name: attempt.skill.clone(),
            action: attempt.action.clone(),
            success: false,
            output: message.clone(),
            duration_ms: 0,
            error_kind: Some(ErrorKind::Validation),
        });
        self.push_turn(Turn::skill_result(attempt.call, false, message))
            .await;
        self.start_model_turn();
    }

    fn start_execution(&mut self, attempt: Attempt, action: Arc<ActionDescriptor>) {
        self.attempts += 1;
        let attempt_no = self.attempts;
        let cancel = CancellationToken::new();

        tracing::info!(
            session_id = self.id.as_str(),
            action = attempt.qualified_name().as_str(),
            confirm_id = attempt.confirm_id.as_deref().unwrap_or(""),
            "executing action"
        );
        self.emit(Outbound::SkillStart {
            skill_name: attempt.skill.clone(),
            action: attempt.action.clone(),
        });

        let executor = self.services.executor.clone();
        let params = attempt.params.clone();
        let token = cancel.clone();
        let report = self.internal.clone();
        tokio::spawn(async move {
            let run = tokio::spawn(async move { executor.execute(&action, &params, None, token).await });
            let result = match run.await {
                Ok(result) => result,
                Err(e) => ExecutionResult::crashed(format!("capability task failed: {e}")),
            };
            let _ = report.send(Internal::Executed {
                attempt: attempt_no,
                result,
            });
        });

        self.set_phase(Phase::Executing {
            attempt_no,
            cancel,
            cancel_requested: false,
            attempt: Box::new(attempt),
        });
    }

    async fn on_executed(&mut self, attempt: Attempt, cancel_requested: bool, result: ExecutionResult) {
        let outcome = match result.error_kind() {
            None => AuditOutcome::Success,
            Some(ErrorKind::Timeout) => AuditOutcome::Timeout,
            Some(ErrorKind::Cancelled) => AuditOutcome::Cancelled,
            Some(ErrorKind::Validation) => AuditOutcome::ValidationFailed,
            Some(ErrorKind::Failure | ErrorKind::Unavailable) => AuditOutcome::Failure,
        };
        let detail = match &result.error {
            Some(error) => error.message.as_str(),
            None => result.output.as_str(),
        };

        // Audit first: the trail is never behind what the user has seen.
        self.record(&attempt, outcome, Some(detail), Some(result.duration_ms()))
            .await;
        self.emit(Outbound::SkillResult {
            skill_name: attempt.skill.clone(),
            action: attempt.action.clone(),
            success: result.success,
            output: result.output.clone(),
            duration_ms: result.duration_ms(),
            error_kind: result.error_kind(),
        });

        let content = match &result.error {
            None => result.output,
            Some(error) if result.output.is_empty() || result.output == error.message => {
                format!("Error ({}): {}", error.kind, error.message)
            }
            Some(error) => format!("Error ({}): {}\n\n{}", error.kind, error.message, result.output),
        };
        self.push_turn(Turn::skill_result(attempt.call, result.success, content))
            .await;

        if cancel_requested || self.closing {
            self.emit(Outbound::TurnComplete);
            self.set_phase(Phase::Idle);
        } else {
            self.start_model_turn();
        }
    }
}

fn confirmation_frame(pending: &PendingConfirmation, remaining: Duration) -> Outbound {
    Outbound::ConfirmationRequired {
        confirm_id: pending.confirm_id.clone(),
        skill_name: pending.attempt.skill.clone(),
        action: pending.attempt.action.clone(),
        description: pending.description.clone(),
        params: pending.attempt.redacted_params(),
        expires_in_seconds: remaining.as_secs(),
    }
}

/// First line of `text`, cut to `max_chars`.
fn make_title(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    let title: String = line.chars().take(max_chars).collect();
    title.trim_end().to_string()
}

/// Drive one model turn, forwarding events until the stream ends, fails,
/// times out or is cancelled. Nothing is reported after cancellation.
async fn stream_model_turn(
    backend: Arc<dyn ModelBackend>,
    request: GenerateRequest,
    generation: u64,
    deadline: Duration,
    cancel: CancellationToken,
    report: mpsc::UnboundedSender<Internal>,
) {
    let turn = async {
        let mut stream = backend.generate(request).await?;
        while let Some(item) = stream.next().await {
            let event = item?;
            if report.send(Internal::Model { generation, event }).is_err() {
                break;
            }
        }
        Ok::<(), BackendError>(())
    };

    let result = tokio::select! {
        _ = cancel.cancelled() => return,
        outcome = tokio::time::timeout(deadline, turn) => outcome.unwrap_or(Err(BackendError::Timeout {
            seconds: deadline.as_secs(),
        })),
    };
    let _ = report.send(Internal::ModelFinished { generation, result });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles_use_first_line() {
        assert_eq!(make_title("  show me the logs\nplease", 60), "show me the logs");
        assert_eq!(make_title("abcdef", 3), "abc");
        assert_eq!(make_title("ab cd", 3), "ab");
    }
}
