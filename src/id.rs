//! Prefixed ID generation for payment entities.
//!
//! Prefixes keep local ids visually distinct from gateway ids (order tokens,
//! capture ids, refund ids) in logs and audit payloads.
//!
//! Format: `{entity}_{uuid_simple}` (32 hex chars, no hyphens)

use uuid::Uuid;

const ALL_PREFIXES: &[&str] = &["ord_", "pay_", "rfd_"];

/// Validate that a string is a well-formed prefixed ID.
///
/// Cheap check to reject garbage before hitting the database.
pub fn is_valid_prefixed_id(s: &str) -> bool {
    let Some(prefix) = ALL_PREFIXES.iter().find(|p| s.starts_with(*p)) else {
        return false;
    };

    let hex_part = &s[prefix.len()..];
    hex_part.len() == 32 && hex_part.chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug, Clone, Copy)]
pub enum EntityType {
    Order,
    PaymentAttempt,
    RefundAttempt,
}

impl EntityType {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Order => "ord",
            Self::PaymentAttempt => "pay",
            Self::RefundAttempt => "rfd",
        }
    }

    pub fn gen_id(&self) -> String {
        format!("{}_{}", self.prefix(), Uuid::new_v4().as_simple())
    }
}
