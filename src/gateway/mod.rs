//! Payment gateway port.
//!
//! The capture, checkout, webhook and reconciliation paths only talk to the
//! gateway through [`PaymentGateway`]. A new provider is a new implementation
//! of the trait, never a new branch in the state machine.

mod paypal;
mod token;

pub use paypal::PayPalGateway;
pub use token::TokenCache;

use async_trait::async_trait;
use axum::http::HeaderMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{AppError, msg};
use crate::models::PaymentChannel;

/// How a gateway call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The gateway answered with a non-success HTTP status.
    Http,
    /// No answer within the client timeout.
    Timeout,
    /// Connection-level failure, request may or may not have arrived.
    Transport,
    /// A success status with a body we could not read.
    Decode,
}

/// The single normalized gateway failure. Carries the HTTP status and raw
/// body for diagnostics; callers branch on [`GatewayError::is_ambiguous`],
/// never on provider-specific error types.
#[derive(Debug, Clone, Error)]
#[error("gateway {operation} failed ({kind:?}, status={status:?}): {body}")]
pub struct GatewayError {
    pub operation: &'static str,
    pub kind: FailureKind,
    pub status: Option<u16>,
    pub body: String,
}

impl GatewayError {
    pub fn http(operation: &'static str, status: u16, body: impl Into<String>) -> Self {
        Self {
            operation,
            kind: FailureKind::Http,
            status: Some(status),
            body: body.into(),
        }
    }

    pub fn timeout(operation: &'static str) -> Self {
        Self {
            operation,
            kind: FailureKind::Timeout,
            status: None,
            body: String::new(),
        }
    }

    pub fn transport(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self {
            operation,
            kind: FailureKind::Transport,
            status: None,
            body: err.to_string(),
        }
    }

    pub fn decode(operation: &'static str, status: u16, err: impl std::fmt::Display) -> Self {
        Self {
            operation,
            kind: FailureKind::Decode,
            status: Some(status),
            body: err.to_string(),
        }
    }

    pub(crate) fn from_reqwest(operation: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(operation)
        } else {
            Self::transport(operation, err)
        }
    }

    /// True when money may have moved even though the call did not report
    /// success: timeouts, transport failures, unreadable responses and 5xx.
    /// Such outcomes are resolved by re-querying, never treated as failure.
    pub fn is_ambiguous(&self) -> bool {
        match self.kind {
            FailureKind::Timeout | FailureKind::Transport | FailureKind::Decode => true,
            FailureKind::Http => self.status.is_none_or(|s| s >= 500),
        }
    }
}

// ============ Commands ============

#[derive(Debug, Clone, Serialize)]
pub struct CreateOrderCommand {
    pub idempotency_key: String,
    /// Local attempt id, echoed back by the gateway as the reference.
    pub reference_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub return_url: Option<String>,
    pub cancel_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureCommand {
    pub idempotency_key: String,
    pub external_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundCommand {
    pub idempotency_key: String,
    pub capture_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub note: Option<String>,
}

// ============ Results ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayOrderStatus {
    Created,
    Saved,
    Approved,
    Voided,
    Completed,
    PayerActionRequired,
    Unknown,
}

impl GatewayOrderStatus {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Self::Created,
            "SAVED" => Self::Saved,
            "APPROVED" => Self::Approved,
            "VOIDED" => Self::Voided,
            "COMPLETED" => Self::Completed,
            "PAYER_ACTION_REQUIRED" => Self::PayerActionRequired,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureStatus {
    Completed,
    Declined,
    Failed,
    Pending,
    Refunded,
    PartiallyRefunded,
    Unknown,
}

impl CaptureStatus {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "COMPLETED" => Self::Completed,
            "DECLINED" => Self::Declined,
            "FAILED" => Self::Failed,
            "PENDING" => Self::Pending,
            "REFUNDED" => Self::Refunded,
            "PARTIALLY_REFUNDED" => Self::PartiallyRefunded,
            _ => Self::Unknown,
        }
    }
}

/// One capture on a gateway order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureInfo {
    pub capture_id: String,
    pub status: CaptureStatus,
    /// Unix seconds.
    pub captured_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CreatedOrder {
    pub external_id: String,
    pub approve_url: Option<String>,
    pub raw: String,
}

/// Authoritative gateway view of an order, as returned by fetch and capture.
#[derive(Debug, Clone)]
pub struct GatewayOrder {
    pub external_id: String,
    pub status: GatewayOrderStatus,
    pub approve_url: Option<String>,
    pub capture: Option<CaptureInfo>,
    pub raw: String,
}

#[derive(Debug, Clone)]
pub struct RefundResult {
    pub refund_id: Option<String>,
    /// Raw gateway status string, mapped with `RefundStatus::from_gateway`.
    pub status: String,
    pub raw: String,
}

/// Signature headers sent with every webhook delivery.
#[derive(Debug, Clone)]
pub struct WebhookHeaders {
    pub auth_algo: String,
    pub cert_url: String,
    pub transmission_id: String,
    pub transmission_sig: String,
    /// RFC 3339 timestamp as sent.
    pub transmission_time: String,
}

impl WebhookHeaders {
    pub const AUTH_ALGO: &'static str = "paypal-auth-algo";
    pub const CERT_URL: &'static str = "paypal-cert-url";
    pub const TRANSMISSION_ID: &'static str = "paypal-transmission-id";
    pub const TRANSMISSION_SIG: &'static str = "paypal-transmission-sig";
    pub const TRANSMISSION_TIME: &'static str = "paypal-transmission-time";

    /// Extract the signature headers. Any missing or non-UTF-8 header is a
    /// bad request, rejected before any I/O.
    pub fn from_header_map(headers: &HeaderMap) -> Result<Self, AppError> {
        let get = |name: &str| -> Result<String, AppError> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    tracing::debug!("Webhook rejected: missing header {}", name);
                    AppError::BadRequest(msg::MISSING_WEBHOOK_HEADER.into())
                })
        };

        Ok(Self {
            auth_algo: get(Self::AUTH_ALGO)?,
            cert_url: get(Self::CERT_URL)?,
            transmission_id: get(Self::TRANSMISSION_ID)?,
            transmission_sig: get(Self::TRANSMISSION_SIG)?,
            transmission_time: get(Self::TRANSMISSION_TIME)?,
        })
    }

    /// Transmission time in unix seconds.
    pub fn transmission_timestamp(&self) -> Result<i64, AppError> {
        parse_gateway_time(&self.transmission_time)
            .ok_or_else(|| AppError::BadRequest(msg::INVALID_WEBHOOK_TIME.into()))
    }
}

/// Currencies the gateway only accepts as whole units.
const ZERO_DECIMAL_CURRENCIES: &[&str] = &["HUF", "JPY", "TWD"];

fn currency_decimals(currency: &str) -> u32 {
    if ZERO_DECIMAL_CURRENCIES.contains(&currency.to_ascii_uppercase().as_str()) {
        0
    } else {
        2
    }
}

/// Format minor units as the decimal string the gateway expects.
pub fn format_minor(amount_minor: i64, currency: &str) -> String {
    Decimal::new(amount_minor, currency_decimals(currency)).to_string()
}

/// Parse a gateway decimal amount ("19.99") into minor units. Rejects more
/// significant fractional digits than the currency has.
pub fn parse_minor(value: &str, currency: &str) -> Option<i64> {
    let decimals = currency_decimals(currency);
    let mut amount = Decimal::from_str_exact(value.trim()).ok()?.normalize();
    if amount.scale() > decimals {
        return None;
    }
    amount.rescale(decimals);
    i64::try_from(amount.mantissa()).ok()
}

/// Parse an RFC 3339 gateway timestamp into unix seconds.
pub fn parse_gateway_time(s: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp())
}

/// Capability interface over the external payment provider.
///
/// Exactly five operations. Write operations carry a caller-chosen
/// idempotency key that must be reused across retries of the same logical
/// operation.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Local channel this gateway settles.
    fn channel(&self) -> PaymentChannel;

    async fn create_order(&self, cmd: &CreateOrderCommand) -> Result<CreatedOrder, GatewayError>;

    async fn get_order(&self, external_id: &str) -> Result<GatewayOrder, GatewayError>;

    async fn capture(&self, cmd: &CaptureCommand) -> Result<GatewayOrder, GatewayError>;

    async fn refund(&self, cmd: &RefundCommand) -> Result<RefundResult, GatewayError>;

    async fn verify_signature(
        &self,
        headers: &WebhookHeaders,
        body: &[u8],
    ) -> Result<bool, GatewayError>;
}
