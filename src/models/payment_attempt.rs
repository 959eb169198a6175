use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

/// Status of a payment attempt. Also mirrored onto `orders.pay_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    /// Placeholder row created with the order, not yet used for checkout.
    None,
    Init,
    Pending,
    Success,
    Fail,
    Exception,
    Closed,
}

impl PaymentStatus {
    /// INIT or PENDING: the attempt can still be captured, cancelled or closed.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Init | Self::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Fail | Self::Exception | Self::Closed
        )
    }

    /// Legal attempt transitions. Anything else is rejected.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (None, Init)
                | (Init, Pending)
                | (Init | Pending, Closed)
                | (Init | Pending, Success)
                | (Init | Pending, Fail)
                | (Init | Pending, Exception)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentChannel {
    /// Placeholder channel, never used for a real checkout.
    None,
    ExternalWallet,
    Card,
}

/// Which trigger produced a capture result. Recorded for diagnostics only;
/// every source goes through the same state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CaptureSource {
    User,
    Webhook,
    Scheduler,
    System,
}

/// One try to pay an order through one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub id: String,
    pub order_id: String,
    pub channel: PaymentChannel,
    pub status: PaymentStatus,
    /// Gateway order id, set once the attempt is bound.
    pub external_id: Option<String>,
    pub capture_id: Option<String>,
    /// Integer minor units (e.g. cents).
    pub amount_minor: i64,
    /// ISO 4217 code.
    pub currency: String,
    // Raw gateway payloads, kept for forensic replay
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_payload: Option<String>,
    pub last_polled_at: Option<i64>,
    pub last_notified_at: Option<i64>,
    pub paid_at: Option<i64>,
    /// Set when a gateway-side capture could not be committed locally.
    pub needs_reconcile: bool,
    pub created_at: i64,
    pub updated_at: i64,
}
