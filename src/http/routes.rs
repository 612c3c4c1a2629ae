//! HTTP route definitions

use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{compression::CompressionLayer, cors::{Any, CorsLayer}, trace::TraceLayer};

use crate::app::AppState;
use crate::http::middleware::require_admin;
use crate::rooms::RoomError;
use crate::util::time::uptime_secs;
use crate::ws::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - support multiple origins (comma-separated in CLIENT_ORIGIN)
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    // credentials cannot be combined with a wildcard origin
    let cors = if state.config.client_origin.trim() == "*" {
        cors.allow_origin(Any)
    } else {
        let allowed_origins: Vec<header::HeaderValue> = state
            .config
            .client_origin
            .split(',')
            .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
            .collect();
        cors.allow_origin(allowed_origins).allow_credentials(true)
    };

    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/rooms/:room_id", get(room_status_handler));

    // Admin routes
    let admin_routes = Router::new()
        .route("/rooms/:room_id/publish", post(publish_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .merge(public_routes)
        .merge(admin_routes)
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
    active_rooms: usize,
    connected_clients: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_rooms: state.manager.active_rooms(),
        connected_clients: state.hub.connected(),
    })
}

// ============================================================================
// Room endpoints
// ============================================================================

#[derive(Serialize)]
struct RoomStatusResponse {
    room_id: String,
    status: &'static str,
}

async fn room_status_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Json<RoomStatusResponse> {
    let status = state
        .manager
        .status(&room_id)
        .map(|lifecycle| lifecycle.as_str())
        .unwrap_or("hibernated");
    Json(RoomStatusResponse { room_id, status })
}

#[derive(Deserialize)]
struct PublishRequest {
    source: String,
    /// Client to report compile errors to
    #[serde(default)]
    owner: Option<String>,
}

#[derive(Serialize)]
struct PublishResponse {
    room_id: String,
    reloaded: bool,
}

async fn publish_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(req): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, AppError> {
    let reloaded = state
        .manager
        .publish(&room_id, req.source, req.owner)
        .await?;

    Ok(Json(PublishResponse { room_id, reloaded }))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RoomError> for AppError {
    fn from(e: RoomError) -> Self {
        match e {
            RoomError::InvalidRoomId(_) => AppError::BadRequest(e.to_string()),
            RoomError::Store(_) => AppError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::ai::DisabledAi;
    use crate::config::{Config, EngineConfig};
    use crate::store::{MemoryStore, RoomStore};

    fn test_state() -> (AppState, Arc<MemoryStore>) {
        let config = Config {
            server_addr: "127.0.0.1:0".parse().unwrap(),
            log_level: "info".into(),
            client_origin: "http://localhost:5173".into(),
            admin_token: "letmein".into(),
            supabase_url: None,
            supabase_service_role_key: None,
            gemini_api_key: None,
            engine: EngineConfig::default(),
        };
        let store = Arc::new(MemoryStore::new());
        (AppState::new(config, store.clone(), Arc::new(DisabledAi)), store)
    }

    fn publish_request(token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/rooms/lobby/publish")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder
            .body(Body::from(r#"{"source":"fn init(room) {}"}"#))
            .unwrap()
    }

    #[tokio::test]
    async fn publish_requires_admin_token() {
        let (state, store) = test_state();
        let router = build_router(state);

        let missing = router.clone().oneshot(publish_request(None)).await.unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = router
            .clone()
            .oneshot(publish_request(Some("nope")))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(store.load_logic("lobby").await.unwrap(), None);

        let ok = router
            .oneshot(publish_request(Some("letmein")))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(
            store.load_logic("lobby").await.unwrap().as_deref(),
            Some("fn init(room) {}")
        );
    }

    #[test]
    fn room_errors_map_to_status_codes() {
        let response = AppError::from(RoomError::InvalidRoomId("a b".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
