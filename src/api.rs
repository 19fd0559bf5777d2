//! HTTP API over the send pipeline, series engine and consent store.
//!
//! Everything except `/health` requires `Authorization: Bearer <token>`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::campaign::Template;
use crate::consent::ConsentStore;
use crate::error::{CampaignError, ConsentError, SendError, SeriesError};
use crate::pipeline::{SendOutcome, SendPipeline};
use crate::series::{SeriesEngine, TriggerReport};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: SendPipeline,
    pub engine: Arc<SeriesEngine>,
    pub consent: ConsentStore,
}

/// Expected bearer token for the API.
#[derive(Clone)]
pub struct BearerAuth {
    token: SecretString,
}

impl std::fmt::Debug for BearerAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerAuth")
            .field("token", &"[redacted]")
            .finish()
    }
}

impl BearerAuth {
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }

    /// Constant-time comparison: both sides go through the same MAC and the
    /// tags are compared with `verify_slice`.
    fn accepts(&self, presented: &str) -> bool {
        let expected = self.token.expose_secret();
        if expected.is_empty() {
            return false;
        }
        let Ok(mut expected_mac) = Hmac::<Sha256>::new_from_slice(b"dripmail-api-auth") else {
            return false;
        };
        expected_mac.update(expected.as_bytes());
        let expected_tag = expected_mac.finalize().into_bytes();

        let Ok(mut presented_mac) = Hmac::<Sha256>::new_from_slice(b"dripmail-api-auth") else {
            return false;
        };
        presented_mac.update(presented.as_bytes());
        presented_mac.verify_slice(&expected_tag).is_ok()
    }
}

async fn require_bearer(
    State(auth): State<BearerAuth>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let presented = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if auth.accepts(token) => Ok(next.run(request).await),
        _ => {
            warn!(path = %request.uri().path(), "Rejected unauthenticated request");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Build the router.
pub fn api_routes(state: AppState, auth: BearerAuth) -> Router {
    let protected = Router::new()
        .route("/email/send", post(send_email))
        .route("/series/begin", post(begin_series))
        .route("/series/trigger", post(trigger_series))
        .route("/unsubscribe", post(unsubscribe))
        .route_layer(middleware::from_fn_with_state(auth, require_bearer))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
}

// ── Errors ──────────────────────────────────────────────────────────────

/// Error response: status plus `{"error": message}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "Request failed");
        }
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

fn send_status(e: &SendError) -> StatusCode {
    match e {
        SendError::Render(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SendError::Transport(_) => StatusCode::BAD_GATEWAY,
        SendError::Storage(_) | SendError::Token(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<SendError> for ApiError {
    fn from(e: SendError) -> Self {
        Self::new(send_status(&e), e.to_string())
    }
}

impl From<SeriesError> for ApiError {
    fn from(e: SeriesError) -> Self {
        let status = match &e {
            SeriesError::Campaign(CampaignError::UnknownCampaign { .. }) => StatusCode::NOT_FOUND,
            SeriesError::Campaign(_) => StatusCode::BAD_GATEWAY,
            SeriesError::EmptyCampaign { .. } | SeriesError::InvalidDelay { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            SeriesError::Storage(_) | SeriesError::UnknownStep { .. } | SeriesError::Aborted(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, e.to_string())
    }
}

impl From<ConsentError> for ApiError {
    fn from(e: ConsentError) -> Self {
        let status = match &e {
            ConsentError::InvalidToken(_) => StatusCode::BAD_REQUEST,
            ConsentError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

// ── Handlers ────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "dripmail"
    }))
}

#[derive(Deserialize)]
struct SendRequest {
    template: Template,
    email: String,
}

async fn send_email(
    State(state): State<AppState>,
    Json(body): Json<SendRequest>,
) -> Result<Json<SendOutcome>, ApiError> {
    let outcome = state.pipeline.send(&body.template, &body.email).await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct BeginSeriesRequest {
    email: String,
    series_name: String,
}

async fn begin_series(
    State(state): State<AppState>,
    Json(body): Json<BeginSeriesRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let enrolled = state
        .engine
        .begin_series(&body.email, &body.series_name)
        .await?;
    Ok(Json(serde_json::json!({ "enrolled": enrolled })))
}

async fn trigger_series(State(state): State<AppState>) -> Result<Json<TriggerReport>, ApiError> {
    Ok(Json(state.engine.trigger_due().await?))
}

#[derive(Deserialize)]
struct UnsubscribeRequest {
    token: String,
}

async fn unsubscribe(
    State(state): State<AppState>,
    Json(body): Json<UnsubscribeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.consent.unsubscribe(&body.token).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}
