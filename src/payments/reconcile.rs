//! Reconciliation scanner.
//!
//! Walks unsettled attempts, asks the gateway for the truth and applies it
//! through the normal capture path. One candidate failing never stops the
//! batch. Also drains the refund outbox.

use crate::config::clamp_batch;
use crate::db::{AppState, queries};
use crate::error::Result;
use crate::gateway::GatewayOrderStatus;
use crate::models::{CaptureSource, PaymentAttempt};

use super::capture::{self, CaptureDisposition, CaptureOutcome};
use super::refund;

async fn reconcile_attempt(state: &AppState, attempt: &PaymentAttempt) -> Result<CaptureOutcome> {
    let Some(external_id) = attempt.external_id.as_deref() else {
        return Ok(CaptureOutcome::unchanged(attempt, CaptureDisposition::Unresolved));
    };

    let order = match state.gateway.get_order(external_id).await {
        Ok(order) => order,
        Err(e) => {
            // Still counts as polled so a broken attempt does not starve the rest
            let conn = state.db.get()?;
            queries::mark_polled(&conn, &attempt.id, None, None)?;
            return Err(e.into());
        }
    };

    {
        let conn = state.db.get()?;
        let capture_id = order.capture.as_ref().map(|c| c.capture_id.as_str());
        queries::mark_polled(&conn, &attempt.id, Some(&order.raw), capture_id)?;
    }

    if order.status == GatewayOrderStatus::Approved && order.capture.is_none() {
        // Approved but never captured, or our capture never reached the gateway
        return capture::capture_attempt(state, None, &attempt.id, CaptureSource::Scheduler).await;
    }

    capture::settle_from_gateway(state, attempt, &order, CaptureSource::Scheduler).await
}

/// Reconcile up to `limit` unsettled attempts. Returns how many were
/// processed without error.
pub async fn scan(state: &AppState, limit: usize) -> Result<usize> {
    let candidates = {
        let conn = state.db.get()?;
        queries::list_sync_candidates(&conn, clamp_batch(limit))?
    };
    if candidates.is_empty() {
        return Ok(0);
    }

    let mut processed = 0;
    for attempt in &candidates {
        match reconcile_attempt(state, attempt).await {
            Ok(outcome) => {
                processed += 1;
                if outcome.disposition != CaptureDisposition::Unresolved {
                    tracing::info!(
                        "Reconciled attempt {}: {:?} ({})",
                        attempt.id,
                        outcome.disposition,
                        outcome.status.as_ref()
                    );
                }
            }
            Err(e) => tracing::warn!("Reconciliation of attempt {} failed: {}", attempt.id, e),
        }
    }

    tracing::debug!("Reconciliation pass: {}/{} attempts", processed, candidates.len());
    Ok(processed)
}

/// Issue or re-check up to `limit` open refunds. Returns how many reached a
/// final state.
pub async fn scan_refunds(state: &AppState, limit: usize) -> Result<usize> {
    let open = {
        let conn = state.db.get()?;
        queries::list_open_refunds(&conn, clamp_batch(limit))?
    };

    let mut settled = 0;
    for pending in &open {
        match refund::execute_refund(state, &pending.id).await {
            Ok(r) if !r.status.is_open() => settled += 1,
            Ok(_) => {}
            Err(e) => tracing::warn!("Refund {} still open: {}", pending.id, e),
        }
    }
    Ok(settled)
}
