//! coloneld — the colonel session daemon.
//!
//! Hosts live agent sessions over WebSocket plus a small REST surface:
//!
//! **Sessions:**
//! - `GET    /ws?user=<id>[&session_id=<id>]` — WebSocket upgrade; resumes
//!   `session_id` when it belongs to `user`, otherwise starts a new session
//! - `GET    /api/sessions?user=<id>` — stored sessions of a user
//! - `DELETE /api/sessions/{id}` — close and forget a session
//!
//! **Skills and models:**
//! - `GET  /api/skills` — loaded skills and their actions
//! - `POST /api/skills/reload` — rebuild the registry from the skill dirs
//! - `GET  /api/models` — selectable models
//!
//! **Agent-to-agent:**
//! - `GET  /.well-known/agent.json` — A2A agent card listing the loaded skills
//! - `POST /a2a?user=<id>` — JSON-RPC 2.0 `tasks/send`, run as a session of
//!   `user` (default `a2a`) through the same policy and audit path
//!
//! **Audit:**
//! - `GET  /api/audit?skill=&action=&user_id=&session_id=&outcome=&limit=&offset=`
//!
//! **Health:**
//! - `GET  /health` — server status
//!
//! Configuration comes from `$COLONEL_CONFIG` or `./colonel.toml`;
//! `COLONEL_BIND` overrides `server.bind`.
//!
//! Build and run: `cargo run --features server --bin coloneld`

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use colonel::audit::{AuditEntry, AuditFilter, AuditSink};
use colonel::config::ColonelConfig;
use colonel::executor::SkillExecutor;
use colonel::model::{ModelBackend, ModelProfile, OpenAiBackend};
use colonel::policy::PolicyEngine;
use colonel::session::a2a::{self, AgentCard, RpcResponse};
use colonel::session::{
    Connection, FileSessionStore, MemorySessionStore, OutboundFrame, SessionManager,
    SessionServices, SessionStore, SessionSummary,
};
use colonel::skills::capability::CapabilityBindings;
use colonel::skills::{Registry, RegistryHandle};

// ── Server state ──────────────────────────────────────────────────────────

struct ServerState {
    config: ColonelConfig,
    manager: Arc<SessionManager>,
}

impl ServerState {
    fn build(config: ColonelConfig) -> Result<Self> {
        let registry = Registry::from_dirs(&config.skills.dirs, &CapabilityBindings::new())?
            .retain_enabled(&config.skills.enabled);
        tracing::info!(
            skills = registry.len(),
            actions = registry.action_count(),
            "skill registry loaded"
        );

        let store: Arc<dyn SessionStore> = match &config.session.store_dir {
            Some(dir) => Arc::new(FileSessionStore::new(dir.clone())),
            None => Arc::new(MemorySessionStore::new()),
        };
        let backend: Arc<dyn ModelBackend> = Arc::new(OpenAiBackend::new(&config.backend));

        let services = SessionServices {
            registry: Arc::new(RegistryHandle::new(registry)),
            policy: Arc::new(PolicyEngine::from_config(&config.policy)?),
            executor: SkillExecutor::new(&config.executor),
            audit: Arc::new(AuditSink::from_config(&config.audit)),
            backend,
            store,
            catalog: config.models.catalog()?,
            config: config.session.clone(),
        };

        Ok(Self {
            manager: Arc::new(SessionManager::new(services)),
            config,
        })
    }
}

type ApiError = (StatusCode, String);

// ── Response types ────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    live_sessions: usize,
    registry_generation: u64,
    audit_recorded: u64,
    audit_dropped: u64,
}

#[derive(Serialize)]
struct ModelsResponse {
    default: String,
    models: Vec<ModelProfile>,
}

#[derive(Serialize)]
struct ReloadResponse {
    generation: u64,
    skills: usize,
    actions: usize,
}

#[derive(Deserialize)]
struct UserQuery {
    user: String,
}

#[derive(Deserialize)]
struct A2aQuery {
    user: Option<String>,
}

#[derive(Deserialize)]
struct WsQuery {
    user: Option<String>,
    session_id: Option<String>,
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    let services = state.manager.services();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        live_sessions: state.manager.live_count(),
        registry_generation: services.registry.generation(),
        audit_recorded: services.audit.recorded(),
        audit_dropped: services.audit.dropped(),
    })
}

async fn list_skills(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let registry = state.manager.services().registry.snapshot();
    let skills: Vec<Value> = registry
        .skills()
        .map(|skill| {
            let actions: Vec<Value> = skill
                .actions
                .iter()
                .map(|a| {
                    json!({
                        "name": a.name,
                        "description": a.description,
                        "category": a.category,
                        "confirmation_required": a.confirmation_required,
                        "timeout_seconds": a.timeout.map(|t| t.as_secs()),
                        "params": a.params,
                    })
                })
                .collect();
            json!({
                "name": skill.name,
                "description": skill.description,
                "origin": skill.origin,
                "actions": actions,
            })
        })
        .collect();
    Json(json!({
        "generation": state.manager.services().registry.generation(),
        "skills": skills,
    }))
}

async fn reload_skills(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<ReloadResponse>, ApiError> {
    let handle = &state.manager.services().registry;
    let generation = handle
        .reload(
            &state.config.skills.dirs,
            &CapabilityBindings::new(),
            &state.config.skills.enabled,
        )
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    let registry = handle.snapshot();
    Ok(Json(ReloadResponse {
        generation,
        skills: registry.len(),
        actions: registry.action_count(),
    }))
}

async fn list_models(State(state): State<Arc<ServerState>>) -> Json<ModelsResponse> {
    let catalog = &state.manager.services().catalog;
    Json(ModelsResponse {
        default: catalog.default_profile().id.clone(),
        models: catalog.profiles().to_vec(),
    })
}

async fn list_sessions(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    state
        .manager
        .list_for_user(&query.user)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn delete_session(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.manager.delete(&id).await {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err((StatusCode::NOT_FOUND, format!("session \"{id}\" not found"))),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn query_audit(
    State(state): State<Arc<ServerState>>,
    Query(filter): Query<AuditFilter>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    state
        .manager
        .services()
        .audit
        .query(&filter)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}

// ── Agent-to-agent ────────────────────────────────────────────────────────

async fn agent_card(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Json<AgentCard> {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or(state.config.server.bind.as_str());
    let registry = state.manager.services().registry.snapshot();
    Json(AgentCard::build("colonel", &registry, &format!("http://{host}")))
}

async fn a2a_rpc(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<A2aQuery>,
    body: String,
) -> Json<RpcResponse> {
    let user = query.user.unwrap_or_else(|| "a2a".to_string());
    Json(a2a::handle(&state.manager, &user, &body).await)
}

// ── WebSocket ─────────────────────────────────────────────────────────────

async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let user = query.user.unwrap_or_else(|| "anonymous".to_string());
    ws.on_upgrade(move |socket| handle_ws_session(socket, state, user, query.session_id))
}

async fn handle_ws_session(
    mut socket: WebSocket,
    state: Arc<ServerState>,
    user: String,
    resume: Option<String>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let mut connection =
        Connection::open(Arc::clone(&state.manager), user, resume.as_deref(), tx).await;
    tracing::info!(
        session_id = connection.session().id(),
        user_id = connection.user_id(),
        "client connected"
    );

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => connection.handle_text(text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "websocket receive failed");
                    break;
                }
            },
            Some(frame) = rx.recv() => {
                if socket.send(Message::Text(frame.to_json().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!(
        session_id = connection.session().id(),
        user_id = connection.user_id(),
        "client disconnected"
    );
    connection.close().await;
}

// ── Main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ColonelConfig::load_or_default(None)?;
    let addr = std::env::var("COLONEL_BIND").unwrap_or_else(|_| config.server.bind.clone());

    let state = Arc::new(ServerState::build(config)?);
    tracing::info!("coloneld initialized");

    let app = Router::new()
        // Health.
        .route("/health", get(health))
        // Skills and models.
        .route("/api/skills", get(list_skills))
        .route("/api/skills/reload", post(reload_skills))
        .route("/api/models", get(list_models))
        // Sessions.
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", delete(delete_session))
        // Audit.
        .route("/api/audit", get(query_audit))
        // Agent-to-agent.
        .route("/.well-known/agent.json", get(agent_card))
        .route("/a2a", post(a2a_rpc))
        // WebSocket.
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::clone(&state));

    tracing::info!("coloneld listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await.into_diagnostic()?;

    // Serve with graceful shutdown on SIGTERM/SIGINT.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .into_diagnostic()?;

    state.manager.shutdown().await;
    tracing::info!("coloneld stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("coloneld shutting down");
}
