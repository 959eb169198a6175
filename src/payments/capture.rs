//! Capture application.
//!
//! [`apply_capture_result`] is the only place an attempt becomes SUCCESS, FAIL
//! or EXCEPTION. User-initiated captures, webhooks and the reconciliation
//! scanner all funnel into it, so whichever arrives first wins and the rest
//! observe the settled state.

use chrono::Utc;
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;

use crate::db::AppState;
use crate::db::queries::{self, SettleFields};
use crate::error::{AppError, Result, msg};
use crate::gateway::{CaptureCommand, CaptureStatus, GatewayOrder, GatewayOrderStatus};
use crate::id::is_valid_prefixed_id;
use crate::models::{CaptureSource, OrderStatus, PaymentAttempt, PaymentStatus};

use super::{cancel, refund};

/// Refund reasons recorded on automatically queued refunds.
pub const REASON_LATE_PAYMENT: &str = "late_payment";
pub const REASON_NOT_PAYABLE: &str = "order_not_payable";

/// Idempotency key for the gateway capture of an attempt.
pub fn capture_key(attempt_id: &str) -> String {
    format!("cap-{}", attempt_id)
}

/// A capture result from any source, ready to be applied.
#[derive(Debug, Clone)]
pub struct ApplyCaptureCommand {
    pub attempt_id: String,
    pub order_id: String,
    /// Gateway order id the result refers to. Must match the bound id.
    pub external_id: Option<String>,
    pub success: bool,
    pub capture_id: Option<String>,
    /// Unix seconds; defaults to now.
    pub capture_time: Option<i64>,
    /// Captures later than `order.created_at + window` are quarantined.
    pub freshness_window_secs: Option<i64>,
    pub raw_payload: Option<String>,
    pub source: CaptureSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureDisposition {
    /// Attempt settled SUCCESS and the order is paid.
    Applied,
    /// The attempt was already SUCCESS; nothing written.
    AlreadySucceeded,
    /// Attempt settled FAIL.
    Failed,
    /// Money captured outside the freshness window; refund queued.
    LatePayment,
    /// Money captured for an order or attempt that can no longer take it;
    /// refund queued.
    NotPayable,
    /// Result recorded for audit without a status change.
    AuditOnly,
    /// The gateway voided the order and the attempt was closed.
    Closed,
    /// Outcome not known yet; left for reconciliation.
    Unresolved,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureOutcome {
    pub attempt_id: String,
    pub order_id: String,
    pub status: PaymentStatus,
    pub disposition: CaptureDisposition,
    /// Refund queued by this application, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_id: Option<String>,
}

impl CaptureOutcome {
    fn new(attempt: &PaymentAttempt, status: PaymentStatus, disposition: CaptureDisposition) -> Self {
        Self {
            attempt_id: attempt.id.clone(),
            order_id: attempt.order_id.clone(),
            status,
            disposition,
            refund_id: None,
        }
    }

    /// Outcome that reports the attempt as it currently stands.
    pub fn unchanged(attempt: &PaymentAttempt, disposition: CaptureDisposition) -> Self {
        Self::new(attempt, attempt.status, disposition)
    }
}

fn validate(cmd: &ApplyCaptureCommand) -> Result<()> {
    if cmd.attempt_id.trim().is_empty() || cmd.order_id.trim().is_empty() {
        return Err(AppError::BadRequest(msg::MISSING_IDENTIFIERS.into()));
    }
    if cmd.success && cmd.capture_id.as_deref().is_none_or(|c| c.trim().is_empty()) {
        return Err(AppError::BadRequest(msg::MISSING_CAPTURE_ID.into()));
    }
    Ok(())
}

/// Apply a capture result under the order lock.
///
/// Safe under any number of concurrent callers for the same attempt: at most
/// one moves it out of INIT/PENDING, and a replay after SUCCESS returns
/// [`CaptureDisposition::AlreadySucceeded`] without writing. Captured money
/// that cannot be applied to the order moves the attempt to EXCEPTION and
/// queues a refund in the same transaction.
pub fn apply_capture_result(conn: &mut Connection, cmd: &ApplyCaptureCommand) -> Result<CaptureOutcome> {
    validate(cmd)?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let order = queries::lock_order(&tx, &cmd.order_id)?;
    let attempt = queries::get_payment_attempt(&tx, &cmd.attempt_id)?
        .ok_or_else(|| AppError::NotFound(msg::ATTEMPT_NOT_FOUND.into()))?;

    if attempt.order_id != order.id {
        return Err(AppError::BadRequest(msg::ATTEMPT_ORDER_MISMATCH.into()));
    }

    if attempt.status == PaymentStatus::Success {
        if cmd.success && cmd.capture_id != attempt.capture_id {
            tracing::warn!(
                "Attempt {} already captured as {:?}, ignoring capture {:?} from {}",
                attempt.id,
                attempt.capture_id,
                cmd.capture_id,
                cmd.source.as_ref()
            );
        }
        return Ok(CaptureOutcome::unchanged(&attempt, CaptureDisposition::AlreadySucceeded));
    }

    if let (Some(reported), Some(bound)) = (cmd.external_id.as_deref(), attempt.external_id.as_deref())
        && reported != bound
    {
        return Err(AppError::Conflict(msg::EXTERNAL_ID_MISMATCH.into()));
    }

    let now = Utc::now().timestamp();
    let from_webhook = cmd.source == CaptureSource::Webhook;
    let fields = SettleFields {
        capture_id: cmd.capture_id.as_deref(),
        paid_at: None,
        response_payload: cmd.raw_payload.as_deref().filter(|_| !from_webhook),
        notify_payload: cmd.raw_payload.as_deref().filter(|_| from_webhook),
        notified_at: from_webhook.then_some(now),
    };

    if !cmd.success {
        if !attempt.status.is_active() {
            queries::record_capture_audit(&tx, &attempt.id, &fields)?;
            tx.commit()?;
            return Ok(CaptureOutcome::unchanged(&attempt, CaptureDisposition::AuditOnly));
        }
        if !queries::try_settle_attempt(&tx, &attempt.id, attempt.status, PaymentStatus::Fail, &fields)? {
            return Err(cancel::lost_transition(&tx, &attempt.id));
        }
        queries::set_order_pay_status(&tx, &order.id, PaymentStatus::Fail)?;
        tx.commit()?;

        tracing::info!(
            "Payment attempt {} failed at gateway ({})",
            attempt.id,
            cmd.source.as_ref()
        );
        return Ok(CaptureOutcome::new(&attempt, PaymentStatus::Fail, CaptureDisposition::Failed));
    }

    // A refunded order already had its money returned; keep the evidence only
    if order.status == OrderStatus::Refunded {
        queries::record_capture_audit(&tx, &attempt.id, &fields)?;
        tx.commit()?;
        return Ok(CaptureOutcome::unchanged(&attempt, CaptureDisposition::AuditOnly));
    }

    let capture_time = cmd.capture_time.unwrap_or(now);
    let late = cmd
        .freshness_window_secs
        .is_some_and(|window| capture_time > order.created_at + window);

    if attempt.status.is_active() && order.is_payable() && !late {
        let fields = SettleFields {
            paid_at: Some(capture_time),
            ..fields
        };
        if !queries::try_settle_attempt(&tx, &attempt.id, attempt.status, PaymentStatus::Success, &fields)? {
            return Err(cancel::lost_transition(&tx, &attempt.id));
        }
        let external_id = attempt.external_id.as_deref().or(cmd.external_id.as_deref());
        if !queries::mark_order_paid(&tx, &order.id, attempt.channel, external_id, capture_time)? {
            return Err(AppError::Conflict(msg::ORDER_ALREADY_PAID.into()));
        }
        tx.commit()?;

        tracing::info!(
            "Payment attempt {} captured ({:?}) via {}, order {} paid",
            attempt.id,
            cmd.capture_id,
            cmd.source.as_ref(),
            order.id
        );
        return Ok(CaptureOutcome::new(&attempt, PaymentStatus::Success, CaptureDisposition::Applied));
    }

    // Money moved but cannot settle this order: quarantine and refund
    let (disposition, reason) = if late {
        (CaptureDisposition::LatePayment, REASON_LATE_PAYMENT)
    } else {
        (CaptureDisposition::NotPayable, REASON_NOT_PAYABLE)
    };

    let status = if attempt.status.is_active() {
        if !queries::try_settle_attempt(&tx, &attempt.id, attempt.status, PaymentStatus::Exception, &fields)? {
            return Err(cancel::lost_transition(&tx, &attempt.id));
        }
        PaymentStatus::Exception
    } else {
        queries::record_capture_audit(&tx, &attempt.id, &fields)?;
        attempt.status
    };

    let queued = refund::queue_auto_refund(&tx, &attempt, cmd.capture_id.as_deref(), reason)?;
    tx.commit()?;

    tracing::warn!(
        "Capture {:?} on attempt {} (order {}, status {}) cannot be applied: {}; refund {} queued",
        cmd.capture_id,
        attempt.id,
        order.id,
        attempt.status.as_ref(),
        reason,
        queued.id
    );
    Ok(CaptureOutcome {
        refund_id: Some(queued.id),
        ..CaptureOutcome::new(&attempt, status, disposition)
    })
}

/// Apply a capture result and issue any refund it queued.
///
/// A local storage failure after the gateway already moved money flags the
/// attempt so the scanner repairs it.
pub async fn apply_and_follow_up(state: &AppState, cmd: &ApplyCaptureCommand) -> Result<CaptureOutcome> {
    let result = {
        let mut conn = state.db.get()?;
        apply_capture_result(&mut conn, cmd)
    };

    match result {
        Ok(outcome) => {
            if let Some(refund_id) = &outcome.refund_id
                && let Err(e) = refund::execute_refund(state, refund_id).await
            {
                tracing::warn!("Refund {} not issued yet, will retry: {}", refund_id, e);
            }
            Ok(outcome)
        }
        Err(e) if e.is_storage_failure() => {
            tracing::error!(
                "Capture result for attempt {} not persisted: {}",
                cmd.attempt_id,
                e
            );
            if let Ok(conn) = state.db.get()
                && let Err(flag_err) = queries::flag_for_reconcile(&conn, &cmd.attempt_id)
            {
                tracing::error!(
                    "Failed to flag attempt {} for reconciliation: {}",
                    cmd.attempt_id,
                    flag_err
                );
            }
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// Turn the gateway's authoritative view of an order into a local transition.
pub(crate) async fn settle_from_gateway(
    state: &AppState,
    attempt: &PaymentAttempt,
    order: &GatewayOrder,
    source: CaptureSource,
) -> Result<CaptureOutcome> {
    if order.status == GatewayOrderStatus::Voided {
        let closed = {
            let mut conn = state.db.get()?;
            cancel::close_attempt_for_ops(&mut conn, &attempt.id)?
        };
        return Ok(CaptureOutcome::unchanged(&closed, CaptureDisposition::Closed));
    }

    let capture_id = order.capture.as_ref().map(|c| c.capture_id.as_str());
    let success = match order.capture.as_ref().map(|c| c.status) {
        Some(CaptureStatus::Completed) => true,
        Some(CaptureStatus::Declined | CaptureStatus::Failed) => false,
        _ => {
            let conn = state.db.get()?;
            queries::mark_polled(&conn, &attempt.id, Some(&order.raw), capture_id)?;
            return Ok(CaptureOutcome::unchanged(attempt, CaptureDisposition::Unresolved));
        }
    };

    let cmd = ApplyCaptureCommand {
        attempt_id: attempt.id.clone(),
        order_id: attempt.order_id.clone(),
        external_id: Some(order.external_id.clone()),
        success,
        capture_id: capture_id.map(str::to_string),
        capture_time: order.capture.as_ref().and_then(|c| c.captured_at),
        freshness_window_secs: state.settings.freshness_window_secs(),
        raw_payload: Some(order.raw.clone()),
        source,
    };
    apply_and_follow_up(state, &cmd).await
}

/// Capture an approved attempt at the gateway and apply the result.
///
/// `user_id` restricts the call to the order owner; background callers pass
/// `None`. A timed-out or otherwise ambiguous gateway call leaves the attempt
/// PENDING and flagged for reconciliation. Retries reuse the same
/// idempotency key, so the gateway never captures twice.
pub async fn capture_attempt(
    state: &AppState,
    user_id: Option<&str>,
    attempt_id: &str,
    source: CaptureSource,
) -> Result<CaptureOutcome> {
    if !is_valid_prefixed_id(attempt_id) {
        return Err(AppError::NotFound(msg::ATTEMPT_NOT_FOUND.into()));
    }

    let (attempt, external_id) = {
        let conn = state.db.get()?;
        let attempt = queries::get_payment_attempt(&conn, attempt_id)?
            .ok_or_else(|| AppError::NotFound(msg::ATTEMPT_NOT_FOUND.into()))?;

        if let Some(user_id) = user_id {
            let order = queries::get_order(&conn, &attempt.order_id)?
                .ok_or_else(|| AppError::NotFound(msg::ORDER_NOT_FOUND.into()))?;
            if order.user_id != user_id {
                return Err(AppError::NotFound(msg::ATTEMPT_NOT_FOUND.into()));
            }
        }

        if attempt.status == PaymentStatus::Success {
            return Ok(CaptureOutcome::unchanged(&attempt, CaptureDisposition::AlreadySucceeded));
        }
        if !attempt.status.is_active() {
            return Err(AppError::Conflict(msg::ATTEMPT_NOT_ACTIVE.into()));
        }
        let external_id = attempt
            .external_id
            .clone()
            .ok_or_else(|| AppError::Conflict(msg::ATTEMPT_NOT_BOUND.into()))?;
        (attempt, external_id)
    };

    let cmd = CaptureCommand {
        idempotency_key: capture_key(&attempt.id),
        external_id,
    };

    match state.gateway.capture(&cmd).await {
        Ok(order) => settle_from_gateway(state, &attempt, &order, source).await,
        Err(e) if e.is_ambiguous() => {
            tracing::warn!(
                "Capture of attempt {} has unknown outcome, leaving for reconciliation: {}",
                attempt.id,
                e
            );
            let conn = state.db.get()?;
            queries::mark_polled(&conn, &attempt.id, None, None)?;
            queries::flag_for_reconcile(&conn, &attempt.id)?;
            Ok(CaptureOutcome::unchanged(&attempt, CaptureDisposition::Unresolved))
        }
        Err(e) => {
            tracing::warn!("Gateway rejected capture of attempt {}: {}", attempt.id, e);
            let conn = state.db.get()?;
            queries::mark_polled(&conn, &attempt.id, Some(&e.body), None)?;
            Err(e.into())
        }
    }
}
