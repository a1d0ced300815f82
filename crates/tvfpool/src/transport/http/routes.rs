//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::json;

use crate::bridge::protocol::{InboundMessage, OutboundMessage};
use crate::router::SessionError;
use crate::service::{PoolService, ServiceError};

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub function_name: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct ContinueSessionRequest {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub size: usize,
}

type JsonResponse = (StatusCode, Json<serde_json::Value>);

fn error_body(status: StatusCode, message: impl std::fmt::Display) -> JsonResponse {
    (status, Json(json!({ "error": message.to_string() })))
}

fn session_result(result: Result<OutboundMessage, ServiceError>) -> JsonResponse {
    let error = match result {
        Ok(out) => return (StatusCode::OK, Json(json!(out))),
        Err(e) => e,
    };

    match error {
        ServiceError::NotReady(_) => error_body(StatusCode::SERVICE_UNAVAILABLE, &error),
        ServiceError::ResizeRejected(_) => error_body(StatusCode::UNPROCESSABLE_ENTITY, &error),
        ServiceError::Session(session_error) => match session_error {
            SessionError::AdmissionRejected(_) => {
                error_body(StatusCode::CONFLICT, &session_error)
            }
            SessionError::InvalidSession(_) => error_body(StatusCode::NOT_FOUND, &session_error),
            SessionError::Function {
                execution_id,
                error,
            } => (
                StatusCode::OK,
                Json(json!({
                    "result": "error",
                    "payload": { "error": error },
                    "execution_id": execution_id,
                })),
            ),
            SessionError::BrokenChannel {
                execution_id,
                detail,
            } => (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "result": "error",
                    "payload": { "error": format!("broken channel: {detail}") },
                    "execution_id": execution_id,
                })),
            ),
        },
    }
}

async fn heartbeat(State(service): State<Arc<PoolService>>) -> impl IntoResponse {
    Json(service.heartbeat().await)
}

async fn create_session(
    State(service): State<Arc<PoolService>>,
    Json(request): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    session_result(
        service
            .create(&request.function_name, request.method, request.params)
            .await,
    )
}

async fn continue_session(
    State(service): State<Arc<PoolService>>,
    Path(execution_id): Path<String>,
    Json(request): Json<ContinueSessionRequest>,
) -> impl IntoResponse {
    session_result(
        service
            .continue_session(&execution_id, request.method, request.params)
            .await,
    )
}

async fn invoke(
    State(service): State<Arc<PoolService>>,
    body: Result<Json<InboundMessage>, JsonRejection>,
) -> impl IntoResponse {
    let message = match body {
        Ok(Json(message)) => message,
        Err(rejection) => return error_body(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    if message.function_name.is_some() == message.execution_id.is_some() {
        return error_body(
            StatusCode::BAD_REQUEST,
            "exactly one of function_name and execution_id is required",
        );
    }
    session_result(service.handle(message).await)
}

async fn resize(
    State(service): State<Arc<PoolService>>,
    Json(request): Json<ResizeRequest>,
) -> impl IntoResponse {
    match service.resize(request.size) {
        Ok(snapshot) => (StatusCode::OK, Json(json!(snapshot))),
        Err(e) => error_body(StatusCode::UNPROCESSABLE_ENTITY, e),
    }
}

async fn shutdown(State(service): State<Arc<PoolService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(json!({})))
}

pub fn routes(service: Arc<PoolService>) -> Router {
    Router::new()
        .route("/heartbeat", get(heartbeat))
        .route("/sessions", post(create_session))
        .route("/sessions/{execution_id}", post(continue_session))
        .route("/invoke", post(invoke))
        .route("/pool/size", put(resize))
        .route("/shutdown", post(shutdown))
        .with_state(service)
}
