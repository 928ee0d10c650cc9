//! Control API for the sync service
//!
//! JSON endpoints to start, resume and watch the sync job, inspect and
//! refresh the marketplace credential, run the token monitor, and complete
//! the authorization-code flow. Every response uses the [`ApiResponse`]
//! envelope.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::{CredentialManager, TokenMonitor, TokenStatus};
use crate::error::{AuthError, SyncError};
use crate::job::{JobController, JobOptions, SyncJob, SyncMode};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobController>,
    pub credentials: Arc<CredentialManager>,
    pub monitor: Arc<TokenMonitor>,
}

/// API response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn ok<T: Serialize>(status: StatusCode, data: T) -> Response {
    (
        status,
        Json(ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        }),
    )
        .into_response()
}

/// Error with the HTTP status it maps to
struct ApiError {
    status: StatusCode,
    message: String,
    data: Option<serde_json::Value>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            data: None,
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let (status, message) = match &err {
            SyncError::JobAlreadyRunning => (StatusCode::CONFLICT, "already_running".to_string()),
            e if e.requires_reauthorization() => (
                StatusCode::UNAUTHORIZED,
                format!("{}; re-authorize through /api/auth/url", e),
            ),
            SyncError::InvalidState(_) | SyncError::Validation(_) | SyncError::Config(_) => {
                (StatusCode::BAD_REQUEST, err.to_string())
            }
            SyncError::Auth(AuthError::Expired | AuthError::TokenEndpoint { .. })
            | SyncError::RateLimited { .. }
            | SyncError::HttpStatus { .. }
            | SyncError::Timeout
            | SyncError::Network(_) => (StatusCode::BAD_GATEWAY, err.to_string()),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };
        if status.is_server_error() {
            log::error!("Request failed: {}", err);
        } else {
            log::warn!("Request rejected ({}): {}", status, err);
        }
        Self {
            status,
            message,
            data: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiResponse {
                success: false,
                data: self.data,
                error: Some(self.message),
            }),
        )
            .into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

// ── Sync job ────────────────────────────────────────────────────────────

/// Body of `POST /api/sync/start`; every field is optional
#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    mode: Option<String>,
    batch_size: Option<u32>,
    limit: Option<usize>,
    since_hours: Option<i64>,
}

impl StartRequest {
    fn into_options(self) -> Result<JobOptions, ApiError> {
        let mode = match self.mode.as_deref() {
            Some(raw) => raw
                .parse::<SyncMode>()
                .map_err(|e| ApiError::bad_request(e.to_string()))?,
            None => SyncMode::Full,
        };
        // Ranges are checked by `JobController::start`
        Ok(JobOptions {
            mode,
            batch_size: self.batch_size,
            max_items: self.limit,
            since_hours: self.since_hours,
        })
    }
}

/// Drive the claimed job in the background; the outcome lands in the job record
fn spawn_run(jobs: Arc<JobController>) {
    tokio::spawn(async move {
        if let Err(e) = jobs.run().await {
            log::error!("Background sync ended with error: {}", e);
        }
    });
}

/// GET /api/sync/status
async fn sync_status_handler(State(state): State<AppState>) -> ApiResult {
    let job: SyncJob = state.jobs.status()?;
    Ok(ok(StatusCode::OK, job))
}

/// POST /api/sync/start
async fn sync_start_handler(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let request: StartRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid request body: {}", e)))?
    };

    let job = state.jobs.start(request.into_options()?)?;
    spawn_run(state.jobs.clone());
    Ok(ok(StatusCode::ACCEPTED, job))
}

/// POST /api/sync/resume
async fn sync_resume_handler(State(state): State<AppState>) -> ApiResult {
    let job = state.jobs.prepare_resume()?;
    spawn_run(state.jobs.clone());
    Ok(ok(StatusCode::ACCEPTED, job))
}

// ── Credentials ─────────────────────────────────────────────────────────

/// GET /api/token/status
async fn token_status_handler(State(state): State<AppState>) -> ApiResult {
    let status: TokenStatus = state.credentials.status().await?;
    Ok(ok(StatusCode::OK, status))
}

/// POST /api/token/refresh
async fn token_refresh_handler(State(state): State<AppState>) -> ApiResult {
    match state.credentials.refresh().await {
        Ok(_) => Ok(ok(StatusCode::OK, state.credentials.status().await?)),
        Err(e) if e.requires_reauthorization() => Err(ApiError {
            status: StatusCode::UNAUTHORIZED,
            message: e.to_string(),
            data: Some(serde_json::json!({
                "reauthorization_required": true,
                "authorization_url": state.credentials.authorization_url(),
            })),
        }),
        Err(e) => Err(e.into()),
    }
}

#[derive(Serialize)]
struct MonitorState {
    running: bool,
    changed: bool,
}

/// POST /api/token/monitor/start
async fn monitor_start_handler(State(state): State<AppState>) -> ApiResult {
    let changed = state.monitor.start();
    Ok(ok(
        StatusCode::OK,
        MonitorState {
            running: state.monitor.is_running(),
            changed,
        },
    ))
}

/// POST /api/token/monitor/stop
async fn monitor_stop_handler(State(state): State<AppState>) -> ApiResult {
    let changed = state.monitor.stop().await;
    Ok(ok(
        StatusCode::OK,
        MonitorState {
            running: state.monitor.is_running(),
            changed,
        },
    ))
}

#[derive(Serialize)]
struct AuthUrl {
    url: String,
}

/// GET /api/auth/url
async fn auth_url_handler(State(state): State<AppState>) -> ApiResult {
    Ok(ok(
        StatusCode::OK,
        AuthUrl {
            url: state.credentials.authorization_url(),
        },
    ))
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// GET /auth/callback?code={code}
/// Redirect target of the authorization page
async fn auth_callback_handler(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> ApiResult {
    if let Some(error) = params.error {
        return Err(ApiError::bad_request(format!(
            "authorization denied: {} {}",
            error,
            params.error_description.unwrap_or_default()
        )));
    }
    let code = params
        .code
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("missing authorization code"))?;

    state.credentials.exchange_authorization_code(&code).await?;
    Ok(ok(StatusCode::OK, state.credentials.status().await?))
}

/// Build the control API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sync/status", get(sync_status_handler))
        .route("/api/sync/start", post(sync_start_handler))
        .route("/api/sync/resume", post(sync_resume_handler))
        .route("/api/token/status", get(token_status_handler))
        .route("/api/token/refresh", post(token_refresh_handler))
        .route("/api/token/monitor/start", post(monitor_start_handler))
        .route("/api/token/monitor/stop", post(monitor_stop_handler))
        .route("/api/auth/url", get(auth_url_handler))
        .route("/auth/callback", get(auth_callback_handler))
        .with_state(state)
}

/// Serve the control API until Ctrl-C
///
/// Binds to 0.0.0.0 (all interfaces) to work with Docker port mapping.
pub async fn serve(state: AppState, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let app = create_router(state);
    let addr = format!("0.0.0.0:{}", port);

    log::info!("Control API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {}", e);
            }
            log::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
#[path = "web_tests.rs"]
mod tests;
