//! Refund outbox.
//!
//! Refunds are written as rows first (inside whatever transaction decided
//! the money must go back) and issued to the gateway afterwards. The row id
//! is the idempotency key, so re-issuing after a lost response never refunds
//! twice.

use rusqlite::{Connection, TransactionBehavior};
use serde_json::Value;

use crate::db::queries::{self, NewRefund};
use crate::db::AppState;
use crate::error::{AppError, Result, msg};
use crate::gateway::{RefundCommand, RefundResult, parse_minor};
use crate::models::{
    AUTO_REFUND_KEY, NOTIFIED_REFUND_PREFIX, PaymentAttempt, PaymentStatus, RefundAttempt, RefundStatus,
};

/// Idempotency key for issuing a refund row to the gateway.
pub fn refund_key(refund_id: &str) -> String {
    format!("rfd-{}", refund_id)
}

/// Queue the automatic full refund for captured money that cannot be kept.
/// At most one exists per attempt.
pub fn queue_auto_refund(
    conn: &Connection,
    attempt: &PaymentAttempt,
    capture_id: Option<&str>,
    reason: &str,
) -> Result<RefundAttempt> {
    let (refund, created) = queries::insert_refund_if_absent(
        conn,
        attempt,
        &NewRefund {
            client_key: AUTO_REFUND_KEY,
            external_refund_id: None,
            capture_id: capture_id.or(attempt.capture_id.as_deref()),
            amount_minor: attempt.amount_minor,
            currency: &attempt.currency,
            status: RefundStatus::Init,
            reason: Some(reason),
            response_payload: None,
        },
    )?;
    if !created {
        tracing::debug!("Refund for attempt {} already queued as {}", attempt.id, refund.id);
    }
    Ok(refund)
}

/// Mark the order refunded once successful refunds cover a settled payment.
fn settle_order_if_fully_refunded(conn: &Connection, payment_id: &str) -> Result<()> {
    let Some(attempt) = queries::get_payment_attempt(conn, payment_id)? else {
        return Ok(());
    };
    if attempt.status != PaymentStatus::Success {
        return Ok(());
    }
    let refunded = queries::sum_successful_refunds(conn, &attempt.id)?;
    if refunded >= attempt.amount_minor && queries::mark_order_refunded(conn, &attempt.order_id)? {
        tracing::info!(
            "Order {} fully refunded ({} {})",
            attempt.order_id,
            refunded,
            attempt.currency
        );
    }
    Ok(())
}

/// Issue an open refund row to the gateway.
///
/// INIT and PENDING rows are both (re)issued with the same key; the gateway
/// answers a repeat with the refund it already made. An ambiguous failure
/// leaves the row open for the next scan; a definitive rejection marks it
/// FAIL.
pub async fn execute_refund(state: &AppState, refund_id: &str) -> Result<RefundAttempt> {
    let refund = {
        let conn = state.db.get()?;
        queries::get_refund_attempt(&conn, refund_id)?
            .ok_or_else(|| AppError::NotFound(msg::REFUND_NOT_FOUND.into()))?
    };

    if !refund.status.is_open() || !refund.is_issued_here() {
        return Ok(refund);
    }

    let Some(capture_id) = refund.capture_id.clone() else {
        tracing::error!("Refund {} has no capture id and cannot be issued", refund.id);
        return Err(AppError::Conflict(format!("refund {} has no capture id", refund.id)));
    };

    let cmd = RefundCommand {
        idempotency_key: refund_key(&refund.id),
        capture_id,
        amount_minor: refund.amount_minor,
        currency: refund.currency.clone(),
        note: refund.reason.clone(),
    };

    let result = state.gateway.refund(&cmd).await;
    let mut conn = state.db.get()?;

    match result {
        Ok(issued) => record_issued_refund(&mut conn, &refund, &issued),
        Err(e) if e.is_ambiguous() => {
            queries::touch_refund(&conn, &refund.id)?;
            Err(e.into())
        }
        Err(e) => {
            tracing::error!("Gateway rejected refund {}: {}", refund.id, e);
            queries::try_update_refund(&conn, &refund.id, refund.status, RefundStatus::Fail, None, Some(&e.body))?;
            Err(e.into())
        }
    }
}

/// Write the gateway's answer for an issued refund row.
///
/// A webhook can record the same gateway refund before the answer to our own
/// call arrives. That row is folded into this one so the refund is stored
/// and counted once.
fn record_issued_refund(
    conn: &mut Connection,
    refund: &RefundAttempt,
    issued: &RefundResult,
) -> Result<RefundAttempt> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    queries::lock_order(&tx, &refund.order_id)?;
    let current = queries::get_refund_attempt(&tx, &refund.id)?
        .ok_or_else(|| AppError::NotFound(msg::REFUND_NOT_FOUND.into()))?;
    if current.status != refund.status {
        return Ok(current);
    }
    let mut next = RefundStatus::from_gateway(&issued.status);

    if let Some(external_id) = issued.refund_id.as_deref()
        && let Some(recorded) = queries::get_refund_by_external_id(&tx, external_id)?
        && recorded.id != refund.id
    {
        if recorded.payment_id != refund.payment_id {
            tracing::error!(
                "Gateway refund {} for refund {} is already recorded on payment {}",
                external_id,
                refund.id,
                recorded.payment_id
            );
            return Err(AppError::Conflict(format!(
                "gateway refund {} belongs to another payment",
                external_id
            )));
        }
        if next.is_open() && !recorded.status.is_open() {
            next = recorded.status;
        }
        queries::delete_refund_attempt(&tx, &recorded.id)?;
        tracing::info!(
            "Folded notification row {} for gateway refund {} into refund {}",
            recorded.id,
            external_id,
            refund.id
        );
    }

    let updated = queries::try_update_refund(
        &tx,
        &refund.id,
        refund.status,
        next,
        issued.refund_id.as_deref(),
        Some(&issued.raw),
    )?;
    if updated {
        tracing::info!(
            "Refund {} for payment {} is {} at gateway ({:?})",
            refund.id,
            refund.payment_id,
            next.as_ref(),
            issued.refund_id
        );
        if next == RefundStatus::Success {
            settle_order_if_fully_refunded(&tx, &refund.payment_id)?;
        }
    }
    let current = queries::get_refund_attempt(&tx, &refund.id)?
        .ok_or_else(|| AppError::NotFound(msg::REFUND_NOT_FOUND.into()))?;
    tx.commit()?;
    Ok(current)
}

/// The queued automatic refund a notification reports on, if its answer never
/// reached us: still open, no gateway id yet, same amount.
fn adoptable_auto_refund(
    conn: &Connection,
    attempt: &PaymentAttempt,
    notice: &RefundNotice,
) -> Result<Option<RefundAttempt>> {
    let auto = queries::get_refund_by_client_key(conn, &attempt.id, AUTO_REFUND_KEY)?;
    Ok(auto.filter(|r| {
        r.status.is_open() && r.external_refund_id.is_none() && r.amount_minor == notice.amount_minor
    }))
}

/// Refund state reported by the gateway in a webhook.
#[derive(Debug, Clone)]
pub struct RefundNotice {
    pub external_refund_id: String,
    pub status: String,
    pub amount_minor: i64,
    pub currency: String,
    pub raw: String,
}

impl RefundNotice {
    /// Read a refund resource (`id`, `status`, `amount.value`,
    /// `amount.currency_code`). The amount is required; a refund that cannot
    /// be counted is not recorded.
    pub fn from_resource(resource: &Value, raw: String) -> Result<Self> {
        let external_refund_id = resource
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::BadRequest("refund resource has no id".into()))?
            .to_string();
        let status = resource
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("COMPLETED")
            .to_string();
        let currency = resource
            .pointer("/amount/currency_code")
            .and_then(Value::as_str)
            .map(str::to_ascii_uppercase)
            .ok_or_else(|| {
                AppError::BadRequest(format!("refund {} has no currency", external_refund_id))
            })?;
        let amount_minor = resource
            .pointer("/amount/value")
            .and_then(Value::as_str)
            .and_then(|value| parse_minor(value, &currency))
            .filter(|amount| *amount > 0)
            .ok_or_else(|| {
                AppError::BadRequest(format!("refund {} has no usable amount", external_refund_id))
            })?;

        Ok(Self {
            external_refund_id,
            status,
            amount_minor,
            currency,
            raw,
        })
    }
}

/// Record a refund the gateway reports for an attempt, whether we issued it
/// or it was made outside this service.
pub fn apply_refund_notification(
    conn: &mut Connection,
    attempt: &PaymentAttempt,
    notice: &RefundNotice,
) -> Result<RefundAttempt> {
    if notice.currency != attempt.currency {
        return Err(AppError::BadRequest(format!(
            "refund {} is in {}, payment is in {}",
            notice.external_refund_id, notice.currency, attempt.currency
        )));
    }
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    queries::lock_order(&tx, &attempt.order_id)?;
    let next = RefundStatus::from_gateway(&notice.status);

    let refund = match queries::get_refund_by_external_id(&tx, &notice.external_refund_id)? {
        Some(existing) => {
            if existing.status.is_open() && existing.status != next {
                queries::try_update_refund(&tx, &existing.id, existing.status, next, None, Some(&notice.raw))?;
            }
            queries::get_refund_attempt(&tx, &existing.id)?
                .ok_or_else(|| AppError::NotFound(msg::REFUND_NOT_FOUND.into()))?
        }
        None => match adoptable_auto_refund(&tx, attempt, notice)? {
            Some(auto) => {
                queries::try_update_refund(
                    &tx,
                    &auto.id,
                    auto.status,
                    next,
                    Some(&notice.external_refund_id),
                    Some(&notice.raw),
                )?;
                tracing::info!(
                    "Gateway refund {} matched queued refund {} for attempt {}",
                    notice.external_refund_id,
                    auto.id,
                    attempt.id
                );
                queries::get_refund_attempt(&tx, &auto.id)?
                    .ok_or_else(|| AppError::NotFound(msg::REFUND_NOT_FOUND.into()))?
            }
            None => {
                let client_key = format!("{}{}", NOTIFIED_REFUND_PREFIX, notice.external_refund_id);
                let (refund, created) = queries::insert_refund_if_absent(
                    &tx,
                    attempt,
                    &NewRefund {
                        client_key: &client_key,
                        external_refund_id: Some(&notice.external_refund_id),
                        capture_id: attempt.capture_id.as_deref(),
                        amount_minor: notice.amount_minor,
                        currency: &notice.currency,
                        status: next,
                        reason: Some("gateway_notification"),
                        response_payload: Some(&notice.raw),
                    },
                )?;
                if created {
                    tracing::info!(
                        "Recorded gateway refund {} for attempt {}",
                        notice.external_refund_id,
                        attempt.id
                    );
                }
                refund
            }
        },
    };

    if refund.status == RefundStatus::Success {
        settle_order_if_fully_refunded(&tx, &attempt.id)?;
    }
    tx.commit()?;
    Ok(refund)
}
