use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{rejection::PathRejection, Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use sy_core::types::{SessionId, SessionSummary};
use sy_session::Session;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api_error::ApiError;
use crate::gateway::Gateway;
use crate::ws;

/// Shared state behind every route.
pub struct ApiState {
    pub gateway: Arc<Gateway>,
    /// Interval between transport-level pings on each WebSocket.
    pub heartbeat_interval: Duration,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(gateway: Arc<Gateway>, heartbeat_interval: Duration) -> Self {
        Self {
            gateway,
            heartbeat_interval,
            started_at: Instant::now(),
        }
    }
}

pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub uptime_seconds: u64,
    pub sessions: usize,
    pub connections: usize,
    pub agents: Vec<AgentHealth>,
}

#[derive(Debug, Serialize)]
pub struct AgentHealth {
    pub kind: String,
    pub display_name: String,
    pub transport: String,
    pub outstanding: usize,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let gateway = &state.gateway;
    let pool = gateway.pool();
    let agents = pool
        .outstanding_by_kind()
        .into_iter()
        .map(|(kind, outstanding)| AgentHealth {
            display_name: pool.display_name(&kind).unwrap_or(kind.as_str()).to_string(),
            transport: pool
                .transport(&kind)
                .map(|t| t.to_string())
                .unwrap_or_default(),
            kind: kind.to_string(),
            outstanding,
        })
        .collect();

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        sessions: gateway.registry().len(),
        connections: gateway.connection_count(),
        agents,
    })
}

async fn list_sessions(State(state): State<Arc<ApiState>>) -> Json<Vec<SessionSummary>> {
    Json(state.gateway.registry().list())
}

async fn get_session(
    State(state): State<Arc<ApiState>>,
    id: Result<Path<SessionId>, PathRejection>,
) -> Result<Json<Session>, ApiError> {
    let Path(id) = id?;
    Ok(Json(state.gateway.registry().get(id)?))
}
