use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RefundStatus {
    Init,
    Pending,
    Success,
    Fail,
}

impl RefundStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Init | Self::Pending)
    }

    /// Map a gateway refund status string. Unknown values stay pending so the
    /// refund scan keeps asking.
    pub fn from_gateway(status: &str) -> Self {
        match status.to_ascii_uppercase().as_str() {
            "COMPLETED" => Self::Success,
            "FAILED" | "CANCELLED" => Self::Fail,
            _ => Self::Pending,
        }
    }
}

/// Money flowing back for a captured attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundAttempt {
    pub id: String,
    pub payment_id: String,
    pub order_id: String,
    /// Local dedupe key, unique per payment attempt.
    pub client_key: String,
    pub external_refund_id: Option<String>,
    pub capture_id: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
    pub status: RefundStatus,
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_payload: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Client key used for the single automatic refund of a payment attempt.
pub const AUTO_REFUND_KEY: &str = "auto";

/// Client key prefix for refunds first seen in a gateway notification.
pub const NOTIFIED_REFUND_PREFIX: &str = "ext-";

impl RefundAttempt {
    /// False for refunds made outside this service, which are only tracked.
    pub fn is_issued_here(&self) -> bool {
        !self.client_key.starts_with(NOTIFIED_REFUND_PREFIX)
    }
}
