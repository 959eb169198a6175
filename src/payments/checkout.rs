//! Checkout preparation: pick or create the attempt for an order and channel,
//! then bind it to a gateway order.

use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::config::PaymentSettings;
use crate::db::{AppState, queries};
use crate::error::{AppError, Result, msg};
use crate::gateway::CreateOrderCommand;
use crate::id::is_valid_prefixed_id;
use crate::models::{Order, PaymentAttempt, PaymentChannel, PaymentStatus};

/// Idempotency key for the gateway order created for an attempt.
pub fn checkout_key(attempt_id: &str) -> String {
    format!("co-{}", attempt_id)
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutPrepared {
    pub attempt_id: String,
    pub order_id: String,
    pub currency: String,
    pub amount_minor: i64,
    pub status: PaymentStatus,
    pub external_id: Option<String>,
}

impl From<&PaymentAttempt> for CheckoutPrepared {
    fn from(attempt: &PaymentAttempt) -> Self {
        Self {
            attempt_id: attempt.id.clone(),
            order_id: attempt.order_id.clone(),
            currency: attempt.currency.clone(),
            amount_minor: attempt.amount_minor,
            status: attempt.status,
            external_id: attempt.external_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckoutUrls {
    pub return_url: Option<String>,
    pub cancel_url: Option<String>,
}

/// What the client needs to send the buyer to the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutStarted {
    pub attempt_id: String,
    pub external_id: String,
    pub approve_url: String,
}

/// Fresh INIT attempt for the order, upgrading the placeholder when present.
fn new_attempt(tx: &Transaction<'_>, order: &Order, channel: PaymentChannel) -> Result<PaymentAttempt> {
    if let Some(placeholder) = queries::find_placeholder_attempt(tx, &order.id)? {
        if !queries::try_upgrade_placeholder(tx, &placeholder.id, channel, order.amount_minor, &order.currency)? {
            return Err(AppError::Conflict(msg::STATE_CHANGED.into()));
        }
        return queries::get_payment_attempt(tx, &placeholder.id)?
            .ok_or_else(|| AppError::Internal("placeholder attempt vanished".into()));
    }
    queries::create_payment_attempt(tx, order, channel)
}

/// Return the attempt a checkout for this order and channel should use.
///
/// Idempotent: repeated calls return the same attempt while it stays
/// INIT/PENDING. Switching channel closes attempts on the other channels, so
/// at most one attempt per order is ever active.
pub fn prepare_checkout(
    conn: &mut Connection,
    user_id: &str,
    order_id: &str,
    channel: PaymentChannel,
) -> Result<CheckoutPrepared> {
    if channel == PaymentChannel::None {
        return Err(AppError::BadRequest(msg::INVALID_CHANNEL.into()));
    }
    if !is_valid_prefixed_id(order_id) {
        return Err(AppError::NotFound(msg::ORDER_NOT_FOUND.into()));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let order = queries::lock_order(&tx, order_id)?;

    if order.user_id != user_id {
        return Err(AppError::NotFound(msg::ORDER_NOT_FOUND.into()));
    }
    if order.pay_status == PaymentStatus::Success {
        return Err(AppError::Conflict(msg::ORDER_ALREADY_PAID.into()));
    }
    if !order.status.is_payable() {
        return Err(AppError::Conflict(msg::ORDER_NOT_PAYABLE.into()));
    }

    let closed = queries::close_other_channel_attempts(&tx, &order.id, channel)?;
    if closed > 0 {
        tracing::info!(
            "Closed {} attempt(s) on order {} after switch to {}",
            closed,
            order.id,
            channel.as_ref()
        );
    }

    let attempt = match queries::find_active_attempt(&tx, &order.id, channel)? {
        Some(active) if active.amount_minor == order.amount_minor && active.currency == order.currency => active,
        Some(stale) => {
            // Order total changed since the attempt was created
            if !queries::try_transition_attempt(&tx, &stale.id, stale.status, PaymentStatus::Closed)? {
                return Err(AppError::Conflict(msg::STATE_CHANGED.into()));
            }
            new_attempt(&tx, &order, channel)?
        }
        None => new_attempt(&tx, &order, channel)?,
    };

    let pay_status = if attempt.external_id.is_some() {
        PaymentStatus::Pending
    } else {
        PaymentStatus::Init
    };
    queries::mark_order_checkout(&tx, &order.id, pay_status, channel, attempt.external_id.as_deref())?;
    tx.commit()?;

    Ok(CheckoutPrepared::from(&attempt))
}

/// Record the gateway order created for an attempt and move it to PENDING.
///
/// Binding the same gateway id twice is a no-op. If the order stopped being
/// payable while the gateway call was in flight, the attempt is closed and
/// the caller gets a conflict.
pub fn bind_external_order(
    conn: &mut Connection,
    attempt_id: &str,
    external_id: &str,
    request_payload: Option<&str>,
    response_payload: Option<&str>,
) -> Result<CheckoutPrepared> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let attempt = queries::get_payment_attempt(&tx, attempt_id)?
        .ok_or_else(|| AppError::NotFound(msg::ATTEMPT_NOT_FOUND.into()))?;
    let order = queries::lock_order(&tx, &attempt.order_id)?;

    if let Some(bound) = attempt.external_id.as_deref()
        && bound != external_id
    {
        return Err(AppError::Conflict(msg::EXTERNAL_ID_MISMATCH.into()));
    }

    if !attempt.status.is_active() {
        return Err(AppError::Conflict(msg::ATTEMPT_NOT_ACTIVE.into()));
    }

    if !order.is_payable() {
        queries::try_transition_attempt(&tx, &attempt.id, attempt.status, PaymentStatus::Closed)?;
        tx.commit()?;
        tracing::warn!(
            "Order {} stopped being payable before gateway order {} was bound; attempt {} closed",
            order.id,
            external_id,
            attempt_id
        );
        return Err(AppError::Conflict(msg::ORDER_NOT_PAYABLE.into()));
    }

    if !queries::try_bind_external_id(&tx, &attempt.id, external_id, request_payload, response_payload)? {
        return Err(AppError::Conflict(msg::STATE_CHANGED.into()));
    }
    queries::mark_order_checkout(&tx, &order.id, PaymentStatus::Pending, attempt.channel, Some(external_id))?;

    let bound = queries::get_payment_attempt(&tx, attempt_id)?
        .ok_or_else(|| AppError::NotFound(msg::ATTEMPT_NOT_FOUND.into()))?;
    tx.commit()?;

    Ok(CheckoutPrepared::from(&bound))
}

fn fallback_approve_url(settings: &PaymentSettings, external_id: &str) -> String {
    format!("{}{}", settings.approve_url_base, external_id)
}

/// Prepare the attempt, create the gateway order for it if it has none, and
/// return where to send the buyer.
pub async fn start_checkout(
    state: &AppState,
    user_id: &str,
    order_id: &str,
    urls: &CheckoutUrls,
) -> Result<CheckoutStarted> {
    let channel = state.gateway.channel();
    let prepared = {
        let mut conn = state.db.get()?;
        prepare_checkout(&mut conn, user_id, order_id, channel)?
    };

    if let Some(external_id) = prepared.external_id {
        let approve_url = match state.gateway.get_order(&external_id).await {
            Ok(order) => order.approve_url,
            Err(e) => {
                tracing::warn!("Could not refresh approve link for {}: {}", external_id, e);
                None
            }
        };
        return Ok(CheckoutStarted {
            attempt_id: prepared.attempt_id,
            approve_url: approve_url.unwrap_or_else(|| fallback_approve_url(&state.settings, &external_id)),
            external_id,
        });
    }

    let cmd = CreateOrderCommand {
        idempotency_key: checkout_key(&prepared.attempt_id),
        reference_id: prepared.attempt_id.clone(),
        amount_minor: prepared.amount_minor,
        currency: prepared.currency.clone(),
        return_url: urls.return_url.clone(),
        cancel_url: urls.cancel_url.clone(),
    };
    let created = state.gateway.create_order(&cmd).await?;
    let request_payload = serde_json::to_string(&cmd)?;

    let bound = {
        let mut conn = state.db.get()?;
        bind_external_order(
            &mut conn,
            &prepared.attempt_id,
            &created.external_id,
            Some(&request_payload),
            Some(&created.raw),
        )
    };

    match bound {
        Ok(bound) => Ok(CheckoutStarted {
            attempt_id: bound.attempt_id,
            approve_url: created
                .approve_url
                .unwrap_or_else(|| fallback_approve_url(&state.settings, &created.external_id)),
            external_id: created.external_id,
        }),
        Err(AppError::Conflict(reason)) => {
            // A concurrent checkout may have bound the attempt first
            let current = {
                let mut conn = state.db.get()?;
                prepare_checkout(&mut conn, user_id, order_id, channel)?
            };
            match current.external_id {
                Some(external_id) if current.attempt_id == prepared.attempt_id => Ok(CheckoutStarted {
                    attempt_id: current.attempt_id,
                    approve_url: fallback_approve_url(&state.settings, &external_id),
                    external_id,
                }),
                _ => Err(AppError::Conflict(reason)),
            }
        }
        Err(e) => Err(e),
    }
}
