//! The error taxonomy surfaced across the HTTP boundary, and its mapping
//! to status codes. Node-internal error types ([`NodeError`],
//! [`ReshardError`]) convert into this one at the transport seam; nothing
//! below the transport constructs an [`AppError`] directly.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

use crate::infrastructure::{NodeError, ReshardError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    KeyNotValid,
    NotFound(String),
    /// The local scheme never caught up to the version a peer reported,
    /// within the transport's bounded retry budget. Carries the version
    /// the client should retry against once it observes convergence.
    SchemeConflict(i32),
    BadRequest(String),
    PrepareRefused,
    SwitchRefused,
    MoveRejected,
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::KeyNotValid => write!(f, "key must not be empty"),
            AppError::NotFound(msg) => write!(f, "not found: {msg}"),
            AppError::SchemeConflict(version) => {
                write!(f, "local scheme did not converge to version {version}")
            }
            AppError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            AppError::PrepareRefused => write!(f, "a reconfiguration is already in progress"),
            AppError::SwitchRefused => write!(f, "no prepared scheme matches that version"),
            AppError::MoveRejected => write!(f, "move arrived for an unknown scheme version"),
            AppError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::KeyNotValid => (StatusCode::BAD_REQUEST, json!({"error": self.to_string()})),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, json!({"error": self.to_string()})),
            AppError::SchemeConflict(version) => (
                StatusCode::CONFLICT,
                json!({"error": self.to_string(), "pendingVersion": version}),
            ),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, json!({"error": self.to_string()})),
            AppError::PrepareRefused | AppError::SwitchRefused => {
                (StatusCode::BAD_REQUEST, json!({"error": self.to_string()}))
            }
            AppError::MoveRejected => {
                (StatusCode::PAYMENT_REQUIRED, json!({"error": self.to_string()}))
            }
            AppError::Internal(_) => {
                tracing::error!(error = %self, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "internal error"}))
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<NodeError> for AppError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::KeyNotValid => AppError::KeyNotValid,
            NodeError::WrongSchemeVersion(v) => AppError::SchemeConflict(v),
            NodeError::BadRequest(msg) => AppError::BadRequest(msg),
        }
    }
}

impl From<ReshardError> for AppError {
    fn from(err: ReshardError) -> Self {
        match err {
            ReshardError::PrepareRefused => AppError::PrepareRefused,
            ReshardError::SwitchRefused => AppError::SwitchRefused,
            ReshardError::MoveRejected => AppError::MoveRejected,
            ReshardError::TooFewNodesForShardCount => {
                AppError::BadRequest("2 * num_shards exceeds the current node count".to_string())
            }
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
