//! Session lifecycle: create, resume, route, close.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::config::SessionConfig;
use crate::error::StoreError;
use crate::executor::SkillExecutor;
use crate::model::{ModelBackend, ModelCatalog};
use crate::policy::PolicyEngine;
use crate::skills::RegistryHandle;

use super::actor::{self, SessionHandle};
use super::protocol::{Inbound, Outbound, OutboundFrame, codes};
use super::store::{SessionRecord, SessionStore, SessionSummary};

/// Shared collaborators of every session. Read-only after construction.
pub struct SessionServices {
    pub registry: Arc<RegistryHandle>,
    pub policy: Arc<PolicyEngine>,
    pub executor: SkillExecutor,
    pub audit: Arc<AuditSink>,
    pub backend: Arc<dyn ModelBackend>,
    pub store: Arc<dyn SessionStore>,
    pub catalog: ModelCatalog,
    pub config: SessionConfig,
}

impl fmt::Debug for SessionServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionServices")
            .field("registry_generation", &self.registry.generation())
            .field("executor", &self.executor)
            .field("audit", &self.audit)
            .field("backend", &self.backend.name())
            .field("models", &self.catalog.profiles().len())
            .finish()
    }
}

/// Owns the live sessions.
///
/// A live session sends its frames to the connection that attached it last.
/// Each attach is numbered; a connection only closes the session when it
/// leaves while still holding the latest number.
#[derive(Debug)]
pub struct SessionManager {
    services: Arc<SessionServices>,
    live: DashMap<String, SessionHandle>,
    attachments: DashMap<String, u64>,
    next_attachment: AtomicU64,
}

impl SessionManager {
    pub fn new(services: SessionServices) -> Self {
        Self {
            services: Arc::new(services),
            live: DashMap::new(),
            attachments: DashMap::new(),
            next_attachment: AtomicU64::new(1),
        }
    }

    pub fn services(&self) -> &Arc<SessionServices> {
        &self.services
    }

    /// Resume `resume_id` if it belongs to `user_id`, otherwise start a fresh
    /// session. Outbound frames of the session go to `outbound`.
    pub async fn open(
        &self,
        user_id: &str,
        resume_id: Option<&str>,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
    ) -> SessionHandle {
        self.open_attached(user_id, resume_id, outbound).await.0
    }

    /// [`open`](Self::open), also returning the attachment number to hand
    /// back to [`release`](Self::release).
    async fn open_attached(
        &self,
        user_id: &str,
        resume_id: Option<&str>,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
    ) -> (SessionHandle, u64) {
        let handle = self.open_session(user_id, resume_id, outbound).await;
        let attachment = self.next_attachment.fetch_add(1, Ordering::Relaxed);
        self.attachments.insert(handle.id().to_string(), attachment);
        (handle, attachment)
    }

    async fn open_session(
        &self,
        user_id: &str,
        resume_id: Option<&str>,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
    ) -> SessionHandle {
        self.prune();

        if let Some(id) = resume_id {
            if let Some(handle) = self.resume(user_id, id, &outbound).await {
                return handle;
            }
        }

        let model = self.services.catalog.default_profile().clone();
        let record = SessionRecord::new(Uuid::new_v4().to_string(), user_id, model.id.clone());
        if let Err(e) = self.services.store.create(&record).await {
            tracing::warn!(session_id = record.id.as_str(), error = %e, "session store unavailable, history will not persist");
        }
        self.spawn(record, false, outbound)
    }

    async fn resume(
        &self,
        user_id: &str,
        session_id: &str,
        outbound: &mpsc::UnboundedSender<OutboundFrame>,
    ) -> Option<SessionHandle> {
        let live = self.live.get(session_id).map(|h| h.value().clone());
        if let Some(handle) = live {
            if handle.user_id() != user_id {
                tracing::warn!(session_id, user_id, "resume refused: session belongs to another user");
                return None;
            }
            if handle.attach(outbound.clone()).await.is_ok() {
                return Some(handle);
            }
        }

        match self.services.store.load(session_id).await {
            Ok(Some(record)) if record.user_id == user_id => Some(self.spawn(record, true, outbound.clone())),
            Ok(Some(_)) => {
                tracing::warn!(session_id, user_id, "resume refused: session belongs to another user");
                None
            }
            Ok(None) => {
                tracing::debug!(session_id, "nothing to resume");
                None
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "failed to load session for resume");
                None
            }
        }
    }

    fn spawn(
        &self,
        record: SessionRecord,
        resumed: bool,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
    ) -> SessionHandle {
        let model = self
            .services
            .catalog
            .get(&record.model_id)
            .unwrap_or_else(|| self.services.catalog.default_profile())
            .clone();
        let handle = actor::spawn(self.services.clone(), record, model, resumed, outbound);
        self.live.insert(handle.id().to_string(), handle.clone());
        handle
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.live
            .get(session_id)
            .map(|h| h.value().clone())
            .filter(|h| !h.is_closed())
    }

    pub fn live_count(&self) -> usize {
        self.prune();
        self.live.len()
    }

    /// A connection holding `attachment` is leaving `session_id`. Closes the
    /// session unless another connection has attached it since.
    pub async fn release(&self, session_id: &str, attachment: u64) -> bool {
        if self
            .attachments
            .remove_if(session_id, |_, current| *current == attachment)
            .is_some()
        {
            self.close(session_id).await
        } else {
            tracing::debug!(session_id, attachment, "session attached elsewhere, leaving it open");
            false
        }
    }

    /// Close a live session. Returns whether one was running.
    pub async fn close(&self, session_id: &str) -> bool {
        self.attachments.remove(session_id);
        match self.live.remove(session_id) {
            Some((_, handle)) => {
                handle.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<SessionSummary>, StoreError> {
        self.services.store.list_for_user(user_id).await
    }

    /// Close the session if live and remove its stored history.
    pub async fn delete(&self, session_id: &str) -> Result<bool, StoreError> {
        let was_live = self.close(session_id).await;
        let stored = self.services.store.delete(session_id).await?;
        Ok(was_live || stored)
    }

    /// Close every live session, letting running actions finish.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.live.iter().map(|e| e.key().clone()).collect();
        tracing::info!(sessions = ids.len(), "closing live sessions");
        for id in ids {
            self.close(&id).await;
        }
    }

    fn prune(&self) {
        self.live.retain(|_, handle| !handle.is_closed());
        self.attachments.retain(|id, _| self.live.contains_key(id));
    }
}

// ── Connection ───────────────────────────────────────────────────────────

/// One client connection. Routes frames to its current session and handles
/// `new_session` by swapping sessions.
#[derive(Debug)]
pub struct Connection {
    manager: Arc<SessionManager>,
    user_id: String,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    session: SessionHandle,
    attachment: u64,
}

impl Connection {
    pub async fn open(
        manager: Arc<SessionManager>,
        user_id: impl Into<String>,
        resume_id: Option<&str>,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
    ) -> Self {
        let user_id = user_id.into();
        let (session, attachment) = manager
            .open_attached(&user_id, resume_id, outbound.clone())
            .await;
        Self {
            manager,
            user_id,
            outbound,
            session,
            attachment,
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Handle one raw text frame from the client.
    pub async fn handle_text(&mut self, text: &str) {
        match Inbound::parse(text) {
            Ok(frame) => self.handle(frame).await,
            Err(e) => self.reply(Outbound::error(codes::MALFORMED_FRAME, e.to_string())),
        }
    }

    pub async fn handle(&mut self, frame: Inbound) {
        match frame {
            Inbound::NewSession => {
                self.manager
                    .release(self.session.id(), self.attachment)
                    .await;
                (self.session, self.attachment) = self
                    .manager
                    .open_attached(&self.user_id, None, self.outbound.clone())
                    .await;
            }
            frame => {
                if let Err(e) = self.session.send(frame).await {
                    self.reply(Outbound::terminal_error(codes::SESSION_CLOSED, e.to_string()));
                }
            }
        }
    }

    /// The client went away: close its session, unless a newer connection
    /// has resumed it.
    pub async fn close(self) {
        self.manager
            .release(self.session.id(), self.attachment)
            .await;
    }

    fn reply(&self, event: Outbound) {
        let frame = OutboundFrame {
            session_id: self.session.id().to_string(),
            event,
        };
        if self.outbound.send(frame).is_err() {
            tracing::debug!(
                session_id = self.session.id(),
                "connection gone, reply dropped"
            );
        }
    }
}
