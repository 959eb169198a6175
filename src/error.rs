use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::gateway::GatewayError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Webhook signature did not verify.
    #[error("Unauthorized")]
    Unauthorized,

    /// Webhook transmission time outside the allowed clock skew.
    #[error("Replay rejected: {0}")]
    ReplayRejected(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// True for failures of the local store, where a state change may not
    /// have been persisted even though the gateway already acted.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, AppError::Database(_) | AppError::Pool(_))
    }
}

/// Stable user-facing error messages.
pub mod msg {
    pub const ORDER_NOT_FOUND: &str = "Order not found";
    pub const ATTEMPT_NOT_FOUND: &str = "Payment attempt not found";
    pub const REFUND_NOT_FOUND: &str = "Refund not found";
    pub const ORDER_NOT_PAYABLE: &str = "Order is not payable";
    pub const ORDER_ALREADY_PAID: &str = "Order is already paid";
    pub const ATTEMPT_ALREADY_PAID: &str = "Payment attempt already succeeded";
    pub const ATTEMPT_NOT_ACTIVE: &str = "Payment attempt is already in a terminal state";
    pub const ATTEMPT_NOT_BOUND: &str = "Payment attempt has no gateway order yet";
    pub const ATTEMPT_ORDER_MISMATCH: &str = "Payment attempt does not belong to order";
    pub const EXTERNAL_ID_MISMATCH: &str = "Gateway order id does not match payment attempt";
    pub const STATE_CHANGED: &str = "Payment state changed concurrently";
    pub const INVALID_CHANNEL: &str = "Invalid payment channel";
    pub const MISSING_CAPTURE_ID: &str = "Successful capture requires a capture id";
    pub const MISSING_IDENTIFIERS: &str = "Attempt id and order id are required";
    pub const MISSING_WEBHOOK_HEADER: &str = "Missing webhook signature header";
    pub const INVALID_WEBHOOK_TIME: &str = "Invalid webhook transmission time";
    pub const INVALID_WEBHOOK_PAYLOAD: &str = "Webhook payload is missing event id or type";
    pub const STALE_WEBHOOK: &str = "Webhook transmission time outside allowed skew";
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "Not found", Some(msg.clone())),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "Bad request", Some(msg.clone())),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized", None),
            AppError::ReplayRejected(msg) => {
                (StatusCode::UNAUTHORIZED, "Replay rejected", Some(msg.clone()))
            }
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "Conflict", Some(msg.clone())),
            AppError::Gateway(e) => {
                tracing::error!("Gateway error: {}", e);
                (StatusCode::BAD_GATEWAY, "Payment gateway unavailable", None)
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
            AppError::Pool(e) => {
                tracing::error!("Pool error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
            AppError::Json(e) => {
                tracing::error!("JSON error: {}", e);
                (StatusCode::BAD_REQUEST, "Invalid JSON", Some(e.to_string()))
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
