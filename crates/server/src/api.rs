//! Internal ingress for extractor output.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use cadence_agent::runtime::{DialogueRuntime, RuntimeError, TurnOutcome};
use cadence_core::domain::dialogue::{Extraction, TaskId, TaskStatus, UserId};
use cadence_core::domain::slot::SlotState;
use cadence_core::errors::InterfaceError;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    runtime: Arc<DialogueRuntime>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub user_id: String,
    pub intent: String,
    #[serde(default)]
    pub slot_state: SlotState,
    pub confidence: Option<f64>,
    #[serde(default)]
    pub raw_text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResponse {
    pub correlation_id: String,
    pub reply: String,
    #[serde(flatten)]
    pub outcome: TurnOutcome,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub correlation_id: String,
    pub task_id: TaskId,
    pub status: TaskStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub correlation_id: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorBody>)>;

pub fn router(runtime: Arc<DialogueRuntime>) -> Router {
    Router::new()
        .route("/v1/turns", post(submit_turn))
        .route("/v1/users/{user_id}/cancel", post(cancel_task))
        .with_state(ApiState { runtime })
}

async fn submit_turn(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<TurnRequest>,
) -> ApiResult<impl IntoResponse> {
    let correlation_id = correlation_id(&headers, "turn");
    let user_id = parse_user_id(&request.user_id, &correlation_id)?;

    let mut extraction =
        Extraction::new(request.intent, request.slot_state).with_raw_text(request.raw_text);
    if let Some(confidence) = request.confidence {
        extraction = extraction.with_confidence(confidence.clamp(0.0, 1.0));
    }

    let outcome = state
        .runtime
        .handle_turn_at(&user_id, extraction, Utc::now(), &correlation_id)
        .await
        .map_err(|error| error_response(error, &correlation_id))?;

    Ok(Json(TurnResponse { correlation_id, reply: outcome.reply_text(), outcome }))
}

async fn cancel_task(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let correlation_id = correlation_id(&headers, "cancel");
    let user_id = parse_user_id(&user_id, &correlation_id)?;

    let task_id = state
        .runtime
        .cancel_at(&user_id, Utc::now(), &correlation_id)
        .await
        .map_err(|error| error_response(error, &correlation_id))?;

    Ok(Json(CancelResponse { correlation_id, task_id, status: TaskStatus::Cancelled }))
}

fn correlation_id(headers: &HeaderMap, prefix: &str) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{prefix}-{}", Uuid::new_v4()))
}

fn parse_user_id(raw: &str, correlation_id: &str) -> ApiResult<UserId> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        let error = InterfaceError::BadRequest {
            message: "user id must not be empty".to_string(),
            correlation_id: correlation_id.to_string(),
        };
        return Err(interface_response(error));
    }
    Ok(UserId(trimmed.to_string()))
}

fn error_response(error: RuntimeError, correlation_id: &str) -> (StatusCode, Json<ErrorBody>) {
    let interface = error.into_application().into_interface(correlation_id);
    match &interface {
        InterfaceError::BadRequest { message, .. } => warn!(
            event_name = "system.api.request_rejected",
            correlation_id,
            error = %message,
            "request rejected"
        ),
        InterfaceError::ServiceUnavailable { message, .. } | InterfaceError::Internal { message, .. } => {
            error!(
                event_name = "system.api.request_failed",
                correlation_id,
                error = %message,
                "request failed"
            )
        }
    }
    interface_response(interface)
}

fn interface_response(error: InterfaceError) -> (StatusCode, Json<ErrorBody>) {
    let (status, kind, detail) = match &error {
        InterfaceError::BadRequest { message, .. } => {
            (StatusCode::BAD_REQUEST, "bad_request", Some(message.clone()))
        }
        InterfaceError::ServiceUnavailable { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", None)
        }
        InterfaceError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal", None),
    };
    let body = ErrorBody {
        error: kind,
        message: error.user_message(),
        detail,
        correlation_id: error.correlation_id().to_string(),
    };
    (status, Json(body))
}
