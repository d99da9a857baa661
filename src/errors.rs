use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

/// Standard error response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
}

/// Failure of a single weather provider call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} timed out after {timeout_secs:.1}s")]
    Timeout { provider: String, timeout_secs: f64 },

    #[error("{provider} request failed: {message}")]
    Transport { provider: String, message: String },

    #[error("{provider} returned HTTP {status}")]
    Status { provider: String, status: u16 },

    #[error("{provider} response could not be parsed: {message}")]
    Malformed { provider: String, message: String },
}

impl ProviderError {
    pub(crate) fn from_reqwest(
        provider: &str,
        timeout: std::time::Duration,
        err: reqwest::Error,
    ) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout {
                provider: provider.to_string(),
                timeout_secs: timeout.as_secs_f64(),
            }
        } else if err.is_decode() {
            ProviderError::Malformed {
                provider: provider.to_string(),
                message: err.to_string(),
            }
        } else {
            ProviderError::Transport {
                provider: provider.to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// Failure of a canopy coverage lookup. Never fatal to an assessment.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CanopyError {
    #[error("canopy lookup disabled (no credentials configured)")]
    Disabled,

    #[error("canopy service rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("canopy request timed out")]
    Timeout,

    #[error("canopy request failed: {0}")]
    Transport(String),

    #[error("canopy service returned HTTP {0}")]
    Status(u16),

    #[error("canopy response could not be parsed: {0}")]
    Malformed(String),
}

/// Condition engine error taxonomy.
///
/// `Clone` so a single in-flight refresh result can be handed to every
/// coalesced waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConditionError {
    /// A single provider timed out. Recovered inside the gateway by falling
    /// through to the next provider; surfaced only in logs and status.
    #[error("provider timeout: {0}")]
    ProviderTimeout(String),

    /// Every configured provider failed.
    #[error("all weather providers unavailable: {0}")]
    ProviderUnavailable(String),

    /// Canopy coverage could not be determined; assessments degrade to
    /// neutral coverage instead of failing.
    #[error("canopy coverage unavailable: {0}")]
    CanopyUnavailable(String),

    #[error("unknown location {0}")]
    UnknownLocation(Uuid),

    /// The caller's wait on a refresh exceeded its timeout. The shared fetch
    /// itself keeps running.
    #[error("refresh of location {0} did not finish within {1}s")]
    RefreshTimedOut(Uuid, u64),

    /// The refresh task panicked or was aborted during shutdown.
    #[error("refresh of location {0} aborted: {1}")]
    RefreshAborted(Uuid, String),
}

impl From<CanopyError> for ConditionError {
    fn from(err: CanopyError) -> Self {
        ConditionError::CanopyUnavailable(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<ConditionError> for AppError {
    fn from(err: ConditionError) -> Self {
        match err {
            ConditionError::UnknownLocation(id) => {
                AppError::NotFound(format!("Location {} not found", id))
            }
            ConditionError::ProviderTimeout(_)
            | ConditionError::ProviderUnavailable(_)
            | ConditionError::CanopyUnavailable(_) => {
                AppError::ExternalServiceError(err.to_string())
            }
            ConditionError::RefreshTimedOut(..) => AppError::Timeout(err.to_string()),
            ConditionError::RefreshAborted(..) => AppError::InternalError(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::ExternalServiceError(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg.clone()),
            AppError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        (status, axum::Json(ErrorResponse { error: message })).into_response()
    }
}
