//! HTTP control API for job scheduling.
//!
//! Every route except `/healthz` requires an `Authorization` header, resolved
//! to a user id through the configured [`Authenticator`]. Job rows belong to
//! that user; only the owner may stop or inspect them. When the identity
//! provider is disabled every caller resolves to no user: new jobs are
//! recorded under the sandbox sentinel and ownership checks are skipped, but
//! rows are still required to exist.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::allocator::JobAllocator;
use crate::auth::{self, Authenticator, SANDBOX_USER};
use crate::error::{AllocatorError, AuthError, RegistryError};
use crate::registry::{JobRecord, Registry};

/// Shared state for the control API.
#[derive(Clone)]
pub struct SchedulerState {
    pub authenticator: Arc<dyn Authenticator>,
    pub allocator: Arc<dyn JobAllocator>,
    pub registry: Arc<dyn Registry>,
    /// Session lifetime applied to new jobs.
    pub job_duration: chrono::Duration,
    /// Base URL clients use to reach the proxy, without a trailing slash.
    pub proxy_base_url: String,
}

/// The scheduler's HTTP API.
pub struct SchedulerApi;

impl SchedulerApi {
    /// Build the axum router for the control API.
    pub fn router(state: SchedulerState) -> Router {
        Router::new()
            .route("/start", post(start))
            .route("/stop", post(missing_job_id))
            .route("/stop/{job_id}", post(stop))
            .route("/status", get(missing_job_id))
            .route("/status/{job_id}", get(status))
            .route("/healthz", get(healthcheck))
            .with_state(state)
    }
}

// -- Error mapping --

/// Error responses of the control API. Remote failure detail stays in the
/// logs; clients get short messages.
#[derive(Debug)]
enum ApiError {
    Unauthorized(String),
    BadRequest(String),
    NotFound(String),
    Internal(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Unauthorized(message) => (StatusCode::UNAUTHORIZED, message),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, message.to_string())
            }
        };
        (status, body).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MissingHeader => {
                ApiError::Unauthorized("no authorization header".to_string())
            }
            AuthError::Rejected => ApiError::Unauthorized("invalid token".to_string()),
            AuthError::Provider(reason) => {
                tracing::error!("identity provider failure: {reason}");
                ApiError::Internal("authentication failed")
            }
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound { id } => {
                ApiError::NotFound(format!("no job found with id {id}"))
            }
            other => {
                tracing::error!("registry failure: {other}");
                ApiError::Internal("registry failure")
            }
        }
    }
}

impl From<AllocatorError> for ApiError {
    fn from(e: AllocatorError) -> Self {
        match e {
            AllocatorError::InvalidPayload(reason) => ApiError::BadRequest(reason),
            AllocatorError::InvalidJob { id } => {
                ApiError::BadRequest(format!("invalid job id {id}"))
            }
            AllocatorError::JobNotFound { id } => {
                ApiError::BadRequest(format!("job {id} not found"))
            }
            AllocatorError::Unsupported { operation } => {
                ApiError::BadRequest(format!("{operation} is not supported by this allocator"))
            }
            other => {
                tracing::error!("allocator failure: {other}");
                ApiError::Internal("job allocation failed")
            }
        }
    }
}

// -- Handlers --

async fn healthcheck() -> StatusCode {
    StatusCode::OK
}

async fn missing_job_id() -> ApiError {
    ApiError::BadRequest("missing job id".to_string())
}

#[derive(Debug, Serialize)]
struct StartResponse {
    job_id: String,
}

async fn start(
    State(state): State<SchedulerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let token = auth::extract_token(&headers)?;
    let user = state
        .authenticator
        .resolve(&token)
        .await?
        .unwrap_or_else(|| SANDBOX_USER.to_string());

    // The body is opaque here; the allocator decides what it needs from it.
    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("malformed request body: {e}")))?;

    let job_id = state.allocator.create_job(&token, &payload).await?;

    let record = JobRecord::new(job_id.clone(), user.clone(), state.job_duration);
    state.registry.insert(&record).await?;

    tracing::info!("user {user} created job {job_id}");

    Ok((StatusCode::CREATED, Json(StartResponse { job_id })))
}

async fn stop(
    State(state): State<SchedulerState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let token = auth::extract_token(&headers)?;
    let user = state.authenticator.resolve(&token).await?;

    load_owned_job(&state, &job_id, user.as_deref()).await?;

    state.allocator.destroy_job(&job_id).await?;
    state.registry.delete(&job_id).await?;

    tracing::info!("job {job_id} stopped");
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    ready: bool,
    end_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_url: Option<String>,
}

async fn status(
    State(state): State<SchedulerState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, ApiError> {
    let token = auth::extract_token(&headers)?;
    let user = state.authenticator.resolve(&token).await?;

    let job = load_owned_job(&state, &job_id, user.as_deref()).await?;

    let details = state.allocator.get_job_details(&token, &job_id).await?;

    if let Some(ref host) = details.host {
        // Concurrent status calls write the same value; the race is benign.
        state.registry.update_host(&job_id, host).await?;
        tracing::info!("job {job_id} ready on {host}");
    }

    let end_time = details.end_time.unwrap_or(job.end_time);
    let job_url = details
        .host
        .as_ref()
        .map(|_| format!("{}/{}/renderer", state.proxy_base_url, job_id));

    Ok(Json(StatusResponse {
        ready: details.host.is_some(),
        end_time: end_time.to_rfc3339(),
        job_url,
    }))
}

/// Fetch the row and enforce ownership. `user` is `None` when the identity
/// provider is disabled; the row must still exist.
async fn load_owned_job(
    state: &SchedulerState,
    job_id: &str,
    user: Option<&str>,
) -> Result<JobRecord, ApiError> {
    let job = state.registry.get(job_id).await?;

    if let Some(user) = user {
        if job.user != user {
            tracing::warn!("job owner {} does not match caller {user}", job.user);
            return Err(ApiError::Unauthorized(format!(
                "{user} is not the owner of job {job_id}"
            )));
        }
    }

    Ok(job)
}
