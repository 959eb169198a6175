use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use super::{PaymentChannel, PaymentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    Created,
    PendingPayment,
    Paid,
    Cancelled,
    Closed,
    Refunded,
}

impl OrderStatus {
    pub fn is_payable(&self) -> bool {
        matches!(self, Self::Created | Self::PendingPayment)
    }
}

/// Order as seen by the payment engine. The order subsystem owns the row;
/// this engine only writes status, pay_status, pay_channel,
/// payment_external_id and pay_time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub user_id: String,
    pub status: OrderStatus,
    pub pay_status: PaymentStatus,
    pub pay_channel: Option<PaymentChannel>,
    pub payment_external_id: Option<String>,
    pub pay_time: Option<i64>,
    /// Payable amount in minor units.
    pub amount_minor: i64,
    pub currency: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Order {
    /// Payable status and not already settled.
    pub fn is_payable(&self) -> bool {
        self.status.is_payable() && self.pay_status != PaymentStatus::Success
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrder {
    pub user_id: String,
    pub amount_minor: i64,
    pub currency: String,
}
