//! REST API for the dispatch core
//!
//! One message in, one reply out. Sessions are addressed by id; ids that are
//! not UUIDs are mapped to stable UUIDs.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::error::OrchestrationError;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub message: String,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
}

/// =============================
/// Helpers
/// =============================

fn stable_uuid_from_string(input: &str) -> Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // version 4, RFC4122 variant
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    Uuid::from_bytes(bytes)
}

pub fn parse_or_stable_uuid(value: Option<&str>, fallback_seed: &str) -> Uuid {
    match value {
        Some(v) if !v.trim().is_empty() => {
            Uuid::parse_str(v.trim()).unwrap_or_else(|_| stable_uuid_from_string(v.trim()))
        }
        _ => stable_uuid_from_string(fallback_seed),
    }
}

fn resolve_session(req: &ChatRequest) -> Uuid {
    match (req.session_id.as_deref(), req.user_id.as_deref()) {
        (Some(session), _) => parse_or_stable_uuid(Some(session), "anonymous-session"),
        (None, Some(user)) if !user.trim().is_empty() => {
            parse_or_stable_uuid(None, &format!("user:{}", user.trim()))
        }
        _ => Uuid::new_v4(),
    }
}

fn error_status(e: &OrchestrationError) -> StatusCode {
    match e {
        OrchestrationError::Cancelled | OrchestrationError::Timeout(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        OrchestrationError::CheckpointError(_) | OrchestrationError::DatabaseError(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn parse_session_path(raw: &str) -> Uuid {
    parse_or_stable_uuid(Some(raw), "anonymous-session")
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat_handler(State(state): State<ApiState>, Json(req): Json<ChatRequest>) -> ApiResult {
    if req.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("Message must not be empty".into())),
        );
    }

    let session_id = resolve_session(&req);
    info!(session_id = %session_id, "Chat message received");

    // a dropped request (client gone) cancels the turn
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    match state
        .dispatcher
        .handle_message(session_id, &req.message, cancel)
        .await
    {
        Ok(report) => {
            let reply = report.reply.as_ref();
            (
                StatusCode::OK,
                Json(ApiResponse::success(serde_json::json!({
                    "session_id": session_id.to_string(),
                    "answer": reply.map(|m| m.content.clone()),
                    "role": reply.map(|m| m.role),
                    "worker": reply.and_then(|m| m.worker),
                    "finish": report.finish,
                    "rounds": report.rounds,
                    "outcomes": report.outcomes,
                    "routing": report.decisions,
                    "trace": report.trace,
                }))),
            )
        }
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Turn failed");
            (error_status(&e), Json(ApiResponse::error(format!("Dispatch failed: {}", e))))
        }
    }
}

/// =============================
/// Session Endpoints
/// =============================

async fn get_session(State(state): State<ApiState>, Path(raw): Path<String>) -> ApiResult {
    let session_id = parse_session_path(&raw);

    match state.dispatcher.session_state(session_id).await {
        Ok(Some(conversation)) => (StatusCode::OK, Json(ApiResponse::success(conversation))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("Session {} not found", session_id))),
        ),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

async fn reset_session(State(state): State<ApiState>, Path(raw): Path<String>) -> ApiResult {
    let session_id = parse_session_path(&raw);

    match state.dispatcher.reset_session(session_id).await {
        Ok(existed) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "session_id": session_id.to_string(),
                "existed": existed,
            }))),
        ),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(dispatcher: Arc<Dispatcher>) -> Router {
    let state = ApiState { dispatcher };

    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat_handler))
        .route("/api/sessions/:id", get(get_session).delete(reset_session))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    dispatcher: Arc<Dispatcher>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(dispatcher);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::llm::StaticRouteClassifier;
    use crate::models::{RouteTarget, WorkerId};
    use crate::routing::{FallbackClassifier, FastClassifier, HybridRouter};
    use crate::state::InMemoryCheckpointStore;
    use crate::workers::{HelpWorker, WorkerRegistry};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn help_dispatcher() -> Arc<Dispatcher> {
        let mut registry = WorkerRegistry::new();
        registry.register(Arc::new(HelpWorker::new()));
        let registry = Arc::new(registry);
        let config = DispatchConfig::default();
        let router = HybridRouter::new(
            FastClassifier::default(),
            FallbackClassifier::new(
                Arc::new(StaticRouteClassifier::always(RouteTarget::Worker(WorkerId::Help))),
                &registry.specs(),
                config.classifier_timeout,
            ),
            config.confidence_threshold,
        );
        Arc::new(Dispatcher::new(
            router,
            registry,
            Arc::new(InMemoryCheckpointStore::new()),
            config,
        ))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_stable_uuid() {
        let a = parse_or_stable_uuid(Some("chat-42"), "x");
        let b = parse_or_stable_uuid(Some("chat-42"), "y");
        assert_eq!(a, b);
        assert_eq!(a.get_version_num(), 4);

        let id = Uuid::new_v4();
        assert_eq!(parse_or_stable_uuid(Some(&id.to_string()), "x"), id);
        assert_eq!(parse_or_stable_uuid(Some("  "), "seed"), parse_or_stable_uuid(None, "seed"));
    }

    #[tokio::test]
    async fn test_chat_then_reset() {
        let app = create_router(help_dispatcher());

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"session_id":"demo","message":"hola"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["worker"], "help-worker");
        assert!(json["data"]["answer"].as_str().unwrap().contains("Tarea_completada"));

        let response = app
            .clone()
            .oneshot(Request::get("/api/sessions/demo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(Request::delete("/api/sessions/demo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["data"]["existed"], true);

        let response = app
            .oneshot(Request::get("/api/sessions/demo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let app = create_router(help_dispatcher());
        let response = app
            .oneshot(
                Request::post("/api/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message":"   "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
