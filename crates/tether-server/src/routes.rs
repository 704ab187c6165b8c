use axum::{
    extract::{ws::WebSocketUpgrade, FromRef, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tether_common::{Result, TetherError};
use tether_core::{Hub, SessionInfo, SessionManager, ShellConfig, StatsSampler, SysinfoSampler, SystemStats, TerminalSession};
use tokio::sync::Mutex;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{RequireBearer, RequireQueryToken, TokenValidator};
use crate::ws::WebSocketConnection;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub sessions: Arc<SessionManager>,
    pub shell: Arc<ShellConfig>,
    pub validator: Arc<dyn TokenValidator>,
    pub sampler: Arc<Mutex<dyn StatsSampler>>,
}

impl AppState {
    pub fn new(hub: Arc<Hub>, shell: ShellConfig, validator: Arc<dyn TokenValidator>) -> Self {
        Self {
            hub,
            sessions: Arc::new(SessionManager::new()),
            shell: Arc::new(shell),
            validator,
            sampler: Arc::new(Mutex::new(SysinfoSampler::new())),
        }
    }
}

impl FromRef<AppState> for Arc<dyn TokenValidator> {
    fn from_ref(state: &AppState) -> Self {
        state.validator.clone()
    }
}

/// All endpoints, with request tracing and CORS applied
pub fn router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/ws", get(telemetry_ws))
        .route("/api/terminal/ws", get(terminal_ws))
        .route("/api/terminal/sessions", get(list_sessions))
        .route("/api/system/stats", get(system_stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Configured origins only, or any origin when none are configured
pub fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let origins: Vec<&str> = origins.iter().map(|o| o.trim()).filter(|o| !o.is_empty()).collect();
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return Ok(layer.allow_origin(Any));
    }

    let origins = origins
        .into_iter()
        .map(|origin| {
            HeaderValue::from_str(origin)
                .map_err(|_| TetherError::Config(format!("invalid CORS origin: {}", origin)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(origins)))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn terminal_ws(_auth: RequireQueryToken, State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let conn = WebSocketConnection::new(socket);
        match TerminalSession::serve(conn, &state.shell, state.sessions.clone()).await {
            Ok(summary) => info!(session = %summary.id, reason = ?summary.reason, "Terminal connection finished"),
            Err(e) => warn!("Terminal connection failed: {}", e),
        }
    })
}

async fn telemetry_ws(_auth: RequireBearer, State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let client = state.hub.register(WebSocketConnection::new(socket)).await;
        info!(client = %client.id, "Telemetry client connected");
    })
}

async fn list_sessions(_auth: RequireBearer, State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list_sessions().await)
}

async fn system_stats(_auth: RequireBearer, State(state): State<AppState>) -> Response {
    let sample = state.sampler.lock().await.sample().await;
    match sample {
        Ok(stats) => Json::<SystemStats>(stats).into_response(),
        Err(e) => {
            warn!("Stats request failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}
