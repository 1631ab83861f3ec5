use std::net::SocketAddr;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::DispatchError;
use crate::identity::{IdentityResolver, ResolvedClient};
use crate::scheduler::{Admission, DispatchStats};
use crate::server::DispatchServer;

#[derive(Clone)]
pub struct ApiState {
    pub server: DispatchServer,
    pub identity: IdentityResolver,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct RequestCaptchaResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    captcha_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instruction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueuePositionResponse {
    success: bool,
    /// -1 when the client is not queued.
    position: i64,
    queue_length: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitCaptchaRequest {
    user_answer: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Serialize)]
struct Progress {
    step: u32,
    total: u32,
}

#[derive(Serialize)]
struct SubmitCaptchaResponse {
    success: bool,
    completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    verified: Option<bool>,
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    message: String,
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            DispatchError::NoAssignment => StatusCode::NOT_FOUND,
            DispatchError::Forbidden => StatusCode::FORBIDDEN,
            DispatchError::AlreadyAssigned(_) | DispatchError::ItemTaken(_) => StatusCode::CONFLICT,
            DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::SourceUnavailable(_) | DispatchError::SinkFailure(_) => {
                StatusCode::BAD_GATEWAY
            }
            DispatchError::VerificationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        };
        (
            status,
            Json(ErrorResponse {
                success: false,
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Build the public router. Exposed so tests can drive it directly.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/request-captcha", get(request_captcha_handler))
        .route("/api/queue-position", get(queue_position_handler))
        .route("/api/submit-captcha", post(submit_captcha_handler))
        .route("/api/status", get(status_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_api(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting captcha API server");

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
        e
    })?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Attach the freshly issued token cookie, if any.
fn with_identity(resolved: &ResolvedClient, response: impl IntoResponse) -> Response {
    let mut response = response.into_response();
    if let Some(cookie) = &resolved.issued_cookie {
        response
            .headers_mut()
            .insert(header::SET_COOKIE, cookie.clone());
    }
    response
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn request_captcha_handler(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let resolved = state.identity.resolve(&headers);

    let body = match state.server.request_work(&resolved.client_id).await {
        Ok(Admission::Assigned(item)) => RequestCaptchaResponse {
            success: true,
            session_id: Some(item.id),
            captcha_url: Some(item.url),
            instruction: Some(item.instruction),
            ..Default::default()
        },
        Ok(Admission::Queued {
            position,
            queue_length,
        }) => RequestCaptchaResponse {
            success: false,
            position: Some(position),
            queue_length: Some(queue_length),
            message: Some("No captcha available, waiting in queue".to_string()),
            ..Default::default()
        },
        Err(e) => {
            tracing::error!(client_id = %resolved.client_id, error = %e, "Admission failed");
            return with_identity(&resolved, e);
        }
    };

    with_identity(&resolved, Json(body))
}

async fn queue_position_handler(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let resolved = state.identity.resolve(&headers);
    let status = state.server.queue_position(&resolved.client_id).await;

    with_identity(
        &resolved,
        Json(QueuePositionResponse {
            success: true,
            position: status.position.map_or(-1, |p| p as i64),
            queue_length: status.queue_length,
        }),
    )
}

async fn submit_captcha_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    payload: Result<Json<SubmitCaptchaRequest>, JsonRejection>,
) -> Response {
    let resolved = state.identity.resolve(&headers);

    let request = match payload {
        Ok(Json(request)) if !request.user_answer.trim().is_empty() => request,
        Ok(_) => {
            let err = DispatchError::InvalidRequest("userAnswer must not be empty".to_string());
            return with_identity(&resolved, err);
        }
        Err(rejection) => {
            let err = DispatchError::InvalidRequest(rejection.body_text());
            return with_identity(&resolved, err);
        }
    };

    let result = state
        .server
        .submit_answer(
            &resolved.client_id,
            request.session_id.as_deref(),
            request.user_answer.trim(),
        )
        .await;

    match result {
        Ok(submitted) => {
            let message = if submitted.outcome.completed {
                "Captcha completed"
            } else {
                "Answer recorded"
            };
            with_identity(
                &resolved,
                Json(SubmitCaptchaResponse {
                    success: true,
                    completed: submitted.outcome.completed,
                    message: Some(message.to_string()),
                    progress: Progress {
                        step: submitted.outcome.step,
                        total: submitted.outcome.total,
                    },
                    verified: submitted.verified,
                }),
            )
        }
        Err(e) => {
            tracing::debug!(client_id = %resolved.client_id, error = %e, "Submission rejected");
            with_identity(&resolved, e)
        }
    }
}

async fn status_handler(State(state): State<ApiState>) -> Json<DispatchStats> {
    Json(state.server.stats().await)
}
