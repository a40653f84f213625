//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - [`CallError`]: the domain taxonomy shared by the call engine, the
//!   identities, the transport and the media pipeline. Each variant carries a
//!   stable machine-readable code that appears in status payloads and chat
//!   replies.
//! - [`AppError`]: what HTTP handlers return. It implements actix-web's
//!   `ResponseError` so that every failure turns into the same JSON shape:
//!
//! ```json
//! {
//!   "error": {
//!     "type": "already_in_call",
//!     "message": "A call session is already in progress",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```
//!
//! ## Propagation rules:
//! - Caller misuse (`AlreadyInCall`, `NotInCall`, bad input) is reported
//!   synchronously and never retried.
//! - Transport errors are retried by the identity supervisor up to its budget.
//! - Pipeline failures and timeouts end the current call session, never the
//!   process.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Everything that can go wrong while orchestrating a call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Bad or expired session, or an identity that is not connected
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Network or protocol failure on a platform connection
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("A call session is already in progress")]
    AlreadyInCall,

    #[error("No call session is in progress")]
    NotInCall,

    /// The transcoding subprocess died or stopped accepting audio
    #[error("Media pipeline failure: {0}")]
    PipelineFailure(String),

    /// A bounded wait ran out
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Audio queue is full ({0} jobs pending)")]
    QueueFull(usize),

    #[error("Invalid call reference: {0}")]
    InvalidCallRef(String),

    #[error("Invalid audio source: {0}")]
    InvalidSource(String),

    /// A PCM chunk that is empty or splits a frame
    #[error("Invalid audio chunk: {0}")]
    InvalidAudio(String),

    #[error("Audio job not found: {0}")]
    JobNotFound(String),

    #[error("Audio job {0} has already finished")]
    JobFinished(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Call ended")]
    CallEnded,

    /// The engine task is gone (only happens during shutdown)
    #[error("Call engine is not running")]
    EngineUnavailable,
}

impl CallError {
    /// Stable identifier used in JSON payloads and logs.
    pub fn code(&self) -> &'static str {
        match self {
            CallError::Auth(_) => "auth_error",
            CallError::Transport(_) => "transport_error",
            CallError::AlreadyInCall => "already_in_call",
            CallError::NotInCall => "not_in_call",
            CallError::PipelineFailure(_) => "pipeline_failure",
            CallError::Timeout(_) => "timeout",
            CallError::QueueFull(_) => "queue_full",
            CallError::InvalidCallRef(_) => "invalid_call_ref",
            CallError::InvalidSource(_) => "invalid_source",
            CallError::InvalidAudio(_) => "invalid_audio",
            CallError::JobNotFound(_) => "job_not_found",
            CallError::JobFinished(_) => "job_finished",
            CallError::Cancelled => "cancelled",
            CallError::CallEnded => "call_ended",
            CallError::EngineUnavailable => "engine_unavailable",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            CallError::Auth(_) | CallError::EngineUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            CallError::Transport(_) | CallError::PipelineFailure(_) => StatusCode::BAD_GATEWAY,
            CallError::AlreadyInCall
            | CallError::NotInCall
            | CallError::JobFinished(_)
            | CallError::Cancelled
            | CallError::CallEnded => StatusCode::CONFLICT,
            CallError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CallError::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
            CallError::InvalidCallRef(_)
            | CallError::InvalidSource(_)
            | CallError::InvalidAudio(_) => StatusCode::BAD_REQUEST,
            CallError::JobNotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

/// Errors returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Server-side problems (500)
    Internal(String),

    /// Client sent malformed data (400)
    BadRequest(String),

    /// A call-engine error, mapped by its own status code
    Call(CallError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Call(err) => write!(f, "{}", err),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Call(err) => err.status_code(),
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg.clone()),
            AppError::BadRequest(msg) => ("bad_request", msg.clone()),
            AppError::Call(err) => (err.code(), err.to_string()),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<CallError> for AppError {
    fn from(err: CallError) -> Self {
        AppError::Call(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;
