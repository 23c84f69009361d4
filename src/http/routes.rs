//! HTTP route definitions

use axum::{
    extract::{Extension, Path, State},
    http::{header, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::app::AppState;
use crate::http::middleware::{require_auth, AuthenticatedUser};
use crate::session::{CreateSessionParams, SessionError};
use crate::store::bots::BotKind;
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;
use crate::ws::protocol::{SessionPublic, Visibility};

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - support multiple origins (comma-separated in CLIENT_ORIGIN)
    let allowed_origins: Vec<header::HeaderValue> = state
        .config
        .client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true);

    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/sessions", get(list_sessions_handler))
        .route("/sessions", post(create_session_handler))
        .route("/sessions/:id/start", post(start_session_handler))
        .route("/sessions/:id/kick", post(kick_handler))
        .route("/bots", get(list_bots_handler))
        .route("/bots", post(start_bot_handler))
        .route("/bots/:id", delete(stop_bot_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    live_sessions: usize,
    connected_clients: usize,
    running_bots: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        live_sessions: state.sessions.live_sessions(),
        connected_clients: state.connections.connected_count(),
        running_bots: state.bots.running(),
    })
}

// ============================================================================
// Session endpoints
// ============================================================================

#[derive(Serialize)]
struct SessionSummary {
    id: Uuid,
    name: String,
    map_id: String,
    capacity: u32,
    min_level: u32,
    max_level: u32,
    turn_seconds: u32,
}

async fn list_sessions_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionSummary>>, AppError> {
    let rows = state.sessions.list_public_lobbies().await?;
    let summaries = rows
        .into_iter()
        .map(|row| SessionSummary {
            id: row.id,
            name: row.name,
            map_id: row.map_id,
            capacity: row.capacity,
            min_level: row.min_level,
            max_level: row.max_level,
            turn_seconds: row.turn_seconds,
        })
        .collect();
    Ok(Json(summaries))
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    name: String,
    visibility: Visibility,
    #[serde(default)]
    password: Option<String>,
    capacity: u32,
    min_level: u32,
    max_level: u32,
    map_id: String,
    #[serde(default)]
    turn_seconds: Option<u32>,
    #[serde(default)]
    character_id: Option<Uuid>,
}

async fn create_session_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<SessionPublic>, AppError> {
    if req.name.is_empty() || req.name.len() > 64 {
        return Err(AppError::BadRequest("session name length out of bounds".into()));
    }
    if req.visibility == Visibility::Private && req.password.is_none() {
        return Err(AppError::BadRequest("private sessions need a password".into()));
    }

    let params = CreateSessionParams {
        name: req.name,
        visibility: req.visibility,
        password: req.password,
        capacity: req.capacity,
        min_level: req.min_level,
        max_level: req.max_level,
        map_id: req.map_id,
        turn_seconds: req.turn_seconds,
        character_id: req.character_id,
    };

    let session = state
        .sessions
        .create_session(auth.user_id, auth.username, false, params)
        .await?;
    Ok(Json(session))
}

async fn start_session_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.sessions.start(session_id, auth.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct KickRequest {
    participant_id: Uuid,
}

async fn kick_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<KickRequest>,
) -> Result<StatusCode, AppError> {
    state
        .sessions
        .kick(session_id, auth.user_id, req.participant_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Bot admin endpoints
// ============================================================================

#[derive(Serialize)]
struct BotSummary {
    id: Uuid,
    kind: BotKind,
}

async fn list_bots_handler(State(state): State<AppState>) -> Json<Vec<BotSummary>> {
    let bots = state
        .bots
        .list()
        .into_iter()
        .map(|(id, kind)| BotSummary { id, kind })
        .collect();
    Json(bots)
}

#[derive(Deserialize)]
struct StartBotRequest {
    kind: BotKind,
}

#[derive(Serialize)]
struct StartBotResponse {
    id: Uuid,
}

async fn start_bot_handler(
    State(state): State<AppState>,
    Json(req): Json<StartBotRequest>,
) -> Result<Json<StartBotResponse>, AppError> {
    let id = state
        .bots
        .start_bot(req.kind)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(StartBotResponse { id }))
}

async fn stop_bot_handler(
    State(state): State<AppState>,
    Path(bot_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let stopped = state
        .bots
        .stop_bot(bot_id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    if stopped {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("no such bot".into()))
    }
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden")]
    Forbidden,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound | SessionError::ParticipantNotFound => {
                AppError::NotFound(e.to_string())
            }
            SessionError::Forbidden | SessionError::NotYourTurn => AppError::Forbidden,
            SessionError::NotJoinable
            | SessionError::Full
            | SessionError::AlreadyJoined
            | SessionError::NotReady
            | SessionError::AlreadyStarted => AppError::Conflict(e.to_string()),
            SessionError::LevelOutOfRange
            | SessionError::NotEnoughAp
            | SessionError::OutOfRange
            | SessionError::Dead
            | SessionError::NotInCombat
            | SessionError::Validation(_) => AppError::BadRequest(e.to_string()),
            SessionError::Closed | SessionError::Store(_) => AppError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden".to_string()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
