use crate::db_types::{OwnerId, ScheduledStatus};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

/// Failures of the persistence collaborator.  Always fatal for the current operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Failures talking to the calling platform.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("platform returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unexpected platform response: {0}")]
    Decode(String),
}

/// Rejections and failures of event ingestion and fetch-now refresh.  None of these leave a
/// record half-updated.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("invalid webhook credential")]
    InvalidSignature,
    #[error("ownership violation on call {call_id}: {reason}")]
    OwnershipViolation { call_id: String, reason: String },
    #[error("call {0} not found")]
    RecordNotFound(String),
    #[error("no platform credential configured for owner {0}")]
    MissingCredential(OwnerId),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures placing a call on behalf of an owner.
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("assistant {0} not found for owner")]
    UnknownAssistant(String),
    #[error("phone number {0} not found for owner")]
    UnknownPhoneNumber(String),
    #[error("no platform credential configured for owner {0}")]
    MissingCredential(OwnerId),
    #[error("platform call failed: {0}")]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures dispatching a scheduled call.  Placement failures are also written to the
/// scheduled call's `error_message`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("scheduled call {0} not found")]
    NotFound(Uuid),
    #[error("scheduled call {id} is {status}, not awaiting dispatch")]
    NotDispatchable { id: Uuid, status: ScheduledStatus },
    #[error("scheduled call {0} is not due yet")]
    NotDue(Uuid),
    #[error("{0}")]
    Placement(#[from] PlacementError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("scheduled call {0} not found")]
    NotFound(Uuid),
    #[error("cannot move scheduled call from {from} to {to}")]
    InvalidTransition {
        from: ScheduledStatus,
        to: ScheduledStatus,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures fetching a call recording.  Logged by the worker; never surfaced to a caller.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("download failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("recording host returned {0}")]
    Status(u16),
    #[error("failed to write recording: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// HTTP-facing error.  The message is generic and never carries identifiers or secrets.
#[derive(Debug)]
pub struct AppError(pub StatusCode, pub &'static str);

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} {}", self.0.as_u16(), self.1)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        handle_error(e);
        AppError(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

impl From<CoreError> for AppError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::MalformedEvent(_) => AppError(StatusCode::BAD_REQUEST, "malformed event"),
            CoreError::InvalidSignature => AppError(StatusCode::UNAUTHORIZED, "unauthorized"),
            CoreError::OwnershipViolation { .. } => AppError(StatusCode::FORBIDDEN, "forbidden"),
            CoreError::RecordNotFound(_) => AppError(StatusCode::NOT_FOUND, "call not found"),
            CoreError::MissingCredential(_) => AppError(
                StatusCode::UNPROCESSABLE_ENTITY,
                "platform credential not configured",
            ),
            CoreError::Platform(e) => {
                handle_error(e);
                AppError(StatusCode::BAD_GATEWAY, "platform error")
            }
            CoreError::Store(e) => e.into(),
        }
    }
}

impl From<PlacementError> for AppError {
    fn from(e: PlacementError) -> Self {
        match e {
            PlacementError::UnknownAssistant(_) => {
                AppError(StatusCode::NOT_FOUND, "assistant not found")
            }
            PlacementError::UnknownPhoneNumber(_) => {
                AppError(StatusCode::NOT_FOUND, "phone number not found")
            }
            PlacementError::MissingCredential(_) => AppError(
                StatusCode::UNPROCESSABLE_ENTITY,
                "platform credential not configured",
            ),
            PlacementError::Platform(e) => {
                handle_error(e);
                AppError(StatusCode::BAD_GATEWAY, "platform error")
            }
            PlacementError::Store(e) => e.into(),
        }
    }
}

impl From<ScheduleError> for AppError {
    fn from(e: ScheduleError) -> Self {
        match e {
            ScheduleError::NotFound(_) => {
                AppError(StatusCode::NOT_FOUND, "scheduled call not found")
            }
            ScheduleError::InvalidTransition { .. } => {
                AppError(StatusCode::CONFLICT, "scheduled call can no longer be cancelled")
            }
            ScheduleError::Store(e) => e.into(),
        }
    }
}

pub fn handle_error(e: impl std::error::Error) {
    error!("ERROR: {e}")
}
