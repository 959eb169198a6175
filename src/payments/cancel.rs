//! Closing attempts: user cancellation and operational closes.
//!
//! Both race against capture through the same compare-and-swap, so a cancel
//! and a capture on one attempt cannot both win.

use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::db::queries;
use crate::error::{AppError, Result, msg};
use crate::id::is_valid_prefixed_id;
use crate::models::{PaymentAttempt, PaymentStatus};

/// The conflict reported for a transition that lost to `winner`.
pub(super) fn lost_to(winner: PaymentStatus) -> AppError {
    match winner {
        PaymentStatus::Success => AppError::Conflict(msg::ATTEMPT_ALREADY_PAID.into()),
        s if s.is_terminal() => AppError::Conflict(msg::ATTEMPT_NOT_ACTIVE.into()),
        _ => AppError::Conflict(msg::STATE_CHANGED.into()),
    }
}

/// Re-read an attempt after a lost CAS and report the state that won.
pub(super) fn lost_transition(conn: &Connection, attempt_id: &str) -> AppError {
    match queries::get_payment_attempt(conn, attempt_id) {
        Ok(Some(current)) => lost_to(current.status),
        Ok(None) => AppError::NotFound(msg::ATTEMPT_NOT_FOUND.into()),
        Err(e) => e,
    }
}

/// After losing a CAS, decide from the state that won.
fn resolve_lost_close(tx: &Transaction<'_>, attempt_id: &str) -> Result<PaymentAttempt> {
    let current = queries::get_payment_attempt(tx, attempt_id)?
        .ok_or_else(|| AppError::NotFound(msg::ATTEMPT_NOT_FOUND.into()))?;
    match current.status {
        PaymentStatus::Closed => Ok(current),
        other => Err(lost_to(other)),
    }
}

fn close_locked(tx: &Transaction<'_>, attempt: &PaymentAttempt) -> Result<Option<PaymentAttempt>> {
    if !queries::try_transition_attempt(tx, &attempt.id, attempt.status, PaymentStatus::Closed)? {
        return Ok(None);
    }
    queries::set_order_pay_status(tx, &attempt.order_id, PaymentStatus::Closed)?;
    Ok(Some(PaymentAttempt {
        status: PaymentStatus::Closed,
        ..attempt.clone()
    }))
}

/// Cancel an attempt on behalf of the order owner.
///
/// Cancelling a CLOSED attempt again is a no-op. A SUCCESS attempt is never
/// reopened; the caller gets a conflict.
pub fn cancel_attempt(conn: &mut Connection, user_id: &str, attempt_id: &str) -> Result<PaymentAttempt> {
    if !is_valid_prefixed_id(attempt_id) {
        return Err(AppError::NotFound(msg::ATTEMPT_NOT_FOUND.into()));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let attempt = queries::get_payment_attempt(&tx, attempt_id)?
        .ok_or_else(|| AppError::NotFound(msg::ATTEMPT_NOT_FOUND.into()))?;
    let order = queries::lock_order(&tx, &attempt.order_id)?;

    if order.user_id != user_id {
        return Err(AppError::NotFound(msg::ATTEMPT_NOT_FOUND.into()));
    }

    match attempt.status {
        PaymentStatus::Closed => return Ok(attempt),
        PaymentStatus::Success => {
            return Err(AppError::Conflict(msg::ATTEMPT_ALREADY_PAID.into()));
        }
        s if !s.is_active() => return Err(AppError::Conflict(msg::ATTEMPT_NOT_ACTIVE.into())),
        _ => {}
    }

    let closed = match close_locked(&tx, &attempt)? {
        Some(closed) => closed,
        None => return resolve_lost_close(&tx, attempt_id),
    };
    tx.commit()?;

    tracing::info!("Payment attempt {} cancelled by user {}", attempt_id, user_id);
    Ok(closed)
}

/// Close an attempt for operational reasons (gateway voided the order,
/// operator action). Already-terminal attempts are returned unchanged.
pub fn close_attempt_for_ops(conn: &mut Connection, attempt_id: &str) -> Result<PaymentAttempt> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let attempt = queries::get_payment_attempt(&tx, attempt_id)?
        .ok_or_else(|| AppError::NotFound(msg::ATTEMPT_NOT_FOUND.into()))?;
    queries::lock_order(&tx, &attempt.order_id)?;

    if !attempt.status.is_active() {
        return Ok(attempt);
    }

    let closed = match close_locked(&tx, &attempt)? {
        Some(closed) => closed,
        None => {
            return queries::get_payment_attempt(&tx, attempt_id)?
                .ok_or_else(|| AppError::NotFound(msg::ATTEMPT_NOT_FOUND.into()));
        }
    };
    tx.commit()?;

    tracing::info!("Payment attempt {} closed", attempt_id);
    Ok(closed)
}
