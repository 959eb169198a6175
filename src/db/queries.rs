use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{AppError, Result, msg};
use crate::id::EntityType;
use crate::models::*;

use super::from_row::{
    ORDER_COLS, PAYMENT_ATTEMPT_COLS, REFUND_ATTEMPT_COLS, query_all, query_one,
};

fn now() -> i64 {
    Utc::now().timestamp()
}

// ============ Orders ============

/// Create an order the way the order subsystem does. The payment engine
/// never creates orders itself; this exists for wiring and tests.
pub fn create_order(conn: &Connection, input: &CreateOrder) -> Result<Order> {
    if input.amount_minor <= 0 {
        return Err(AppError::BadRequest("amount_minor must be positive".into()));
    }
    let id = EntityType::Order.gen_id();
    let now = now();
    let currency = input.currency.to_ascii_uppercase();

    conn.execute(
        "INSERT INTO orders (id, user_id, status, pay_status, amount_minor, currency, created_at, updated_at)
         VALUES (?1, ?2, 'created', 'none', ?3, ?4, ?5, ?5)",
        params![&id, &input.user_id, input.amount_minor, &currency, now],
    )?;

    Ok(Order {
        id,
        user_id: input.user_id.clone(),
        status: OrderStatus::Created,
        pay_status: PaymentStatus::None,
        pay_channel: None,
        payment_external_id: None,
        pay_time: None,
        amount_minor: input.amount_minor,
        currency,
        created_at: now,
        updated_at: now,
    })
}

pub fn get_order(conn: &Connection, id: &str) -> Result<Option<Order>> {
    query_one(
        conn,
        &format!("SELECT {} FROM orders WHERE id = ?1", ORDER_COLS),
        &[&id],
    )
}

/// Read the order inside a transaction that already holds the write lock.
///
/// SQLite has no row locks: callers open the transaction with
/// `TransactionBehavior::Immediate`, which takes the database write lock at
/// BEGIN. That serializes every prepare/capture/cancel critical section, which
/// is a superset of the per-order exclusion needed (PostgreSQL equivalent:
/// `SELECT ... FOR UPDATE`).
pub fn lock_order(conn: &Connection, id: &str) -> Result<Order> {
    get_order(conn, id)?.ok_or_else(|| AppError::NotFound(msg::ORDER_NOT_FOUND.into()))
}

/// Mirror an open checkout onto the order. Advances CREATED to
/// PENDING_PAYMENT and never touches an order whose pay_status is SUCCESS.
pub fn mark_order_checkout(
    conn: &Connection,
    order_id: &str,
    pay_status: PaymentStatus,
    channel: PaymentChannel,
    external_id: Option<&str>,
) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE orders SET
            status = CASE WHEN status = 'created' THEN 'pending_payment' ELSE status END,
            pay_status = ?1, pay_channel = ?2, payment_external_id = ?3, updated_at = ?4
         WHERE id = ?5 AND pay_status != 'success'",
        params![pay_status.as_ref(), channel.as_ref(), external_id, now(), order_id],
    )?;
    Ok(affected > 0)
}

/// Mark the order paid. Returns false if it was already settled.
pub fn mark_order_paid(
    conn: &Connection,
    order_id: &str,
    channel: PaymentChannel,
    external_id: Option<&str>,
    pay_time: i64,
) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE orders SET status = 'paid', pay_status = 'success', pay_channel = ?1,
            payment_external_id = ?2, pay_time = ?3, updated_at = ?4
         WHERE id = ?5 AND pay_status != 'success'",
        params![channel.as_ref(), external_id, pay_time, now(), order_id],
    )?;
    Ok(affected > 0)
}

/// Set the order's pay_status unless it is already SUCCESS.
pub fn set_order_pay_status(conn: &Connection, order_id: &str, status: PaymentStatus) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE orders SET pay_status = ?1, updated_at = ?2 WHERE id = ?3 AND pay_status != 'success'",
        params![status.as_ref(), now(), order_id],
    )?;
    Ok(affected > 0)
}

pub fn mark_order_refunded(conn: &Connection, order_id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE orders SET status = 'refunded', updated_at = ?1 WHERE id = ?2 AND status = 'paid'",
        params![now(), order_id],
    )?;
    Ok(affected > 0)
}

// ============ Payment Attempts ============

pub fn get_payment_attempt(conn: &Connection, id: &str) -> Result<Option<PaymentAttempt>> {
    query_one(
        conn,
        &format!("SELECT {} FROM payment_attempts WHERE id = ?1", PAYMENT_ATTEMPT_COLS),
        &[&id],
    )
}

pub fn get_payment_attempt_by_external_id(
    conn: &Connection,
    external_id: &str,
) -> Result<Option<PaymentAttempt>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM payment_attempts WHERE external_id = ?1",
            PAYMENT_ATTEMPT_COLS
        ),
        &[&external_id],
    )
}

pub fn list_payment_attempts_for_order(conn: &Connection, order_id: &str) -> Result<Vec<PaymentAttempt>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM payment_attempts WHERE order_id = ?1 ORDER BY created_at, rowid",
            PAYMENT_ATTEMPT_COLS
        ),
        &[&order_id],
    )
}

/// Most recent INIT/PENDING attempt for the order on the given channel.
pub fn find_active_attempt(
    conn: &Connection,
    order_id: &str,
    channel: PaymentChannel,
) -> Result<Option<PaymentAttempt>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM payment_attempts
             WHERE order_id = ?1 AND channel = ?2 AND status IN ('init', 'pending')
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            PAYMENT_ATTEMPT_COLS
        ),
        &[&order_id, &channel.as_ref()],
    )
}

pub fn find_placeholder_attempt(conn: &Connection, order_id: &str) -> Result<Option<PaymentAttempt>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM payment_attempts
             WHERE order_id = ?1 AND status = 'none' AND channel = 'none'
             ORDER BY created_at, rowid LIMIT 1",
            PAYMENT_ATTEMPT_COLS
        ),
        &[&order_id],
    )
}

fn insert_payment_attempt(
    conn: &Connection,
    order: &Order,
    channel: PaymentChannel,
    status: PaymentStatus,
) -> Result<PaymentAttempt> {
    let id = EntityType::PaymentAttempt.gen_id();
    let now = now();

    conn.execute(
        "INSERT INTO payment_attempts (id, order_id, channel, status, amount_minor, currency, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            &id,
            &order.id,
            channel.as_ref(),
            status.as_ref(),
            order.amount_minor,
            &order.currency,
            now
        ],
    )?;

    Ok(PaymentAttempt {
        id,
        order_id: order.id.clone(),
        channel,
        status,
        external_id: None,
        capture_id: None,
        amount_minor: order.amount_minor,
        currency: order.currency.clone(),
        request_payload: None,
        response_payload: None,
        notify_payload: None,
        last_polled_at: None,
        last_notified_at: None,
        paid_at: None,
        needs_reconcile: false,
        created_at: now,
        updated_at: now,
    })
}

/// Insert a fresh INIT attempt for the order's current amount.
pub fn create_payment_attempt(
    conn: &Connection,
    order: &Order,
    channel: PaymentChannel,
) -> Result<PaymentAttempt> {
    insert_payment_attempt(conn, order, channel, PaymentStatus::Init)
}

/// Insert the NONE/NONE placeholder the order subsystem creates alongside an order.
pub fn create_placeholder_attempt(conn: &Connection, order: &Order) -> Result<PaymentAttempt> {
    insert_payment_attempt(conn, order, PaymentChannel::None, PaymentStatus::None)
}

/// Close every INIT/PENDING attempt on the order that is not on `channel`.
/// Returns the number of attempts closed.
pub fn close_other_channel_attempts(
    conn: &Connection,
    order_id: &str,
    channel: PaymentChannel,
) -> Result<usize> {
    let closed = conn.execute(
        "UPDATE payment_attempts SET status = 'closed', updated_at = ?1
         WHERE order_id = ?2 AND channel != ?3 AND status IN ('init', 'pending')",
        params![now(), order_id, channel.as_ref()],
    )?;
    Ok(closed)
}

/// Atomically upgrade a NONE/NONE placeholder to an INIT attempt.
pub fn try_upgrade_placeholder(
    conn: &Connection,
    id: &str,
    channel: PaymentChannel,
    amount_minor: i64,
    currency: &str,
) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE payment_attempts SET status = 'init', channel = ?1, amount_minor = ?2, currency = ?3, updated_at = ?4
         WHERE id = ?5 AND status = 'none'",
        params![channel.as_ref(), amount_minor, currency, now(), id],
    )?;
    Ok(affected > 0)
}

/// Atomically bind a gateway order id to an INIT/PENDING attempt and move it
/// to PENDING. Rebinding the same id is a no-op success; a different id fails.
pub fn try_bind_external_id(
    conn: &Connection,
    id: &str,
    external_id: &str,
    request_payload: Option<&str>,
    response_payload: Option<&str>,
) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE payment_attempts SET external_id = ?1, status = 'pending',
            request_payload = COALESCE(?2, request_payload),
            response_payload = COALESCE(?3, response_payload),
            updated_at = ?4
         WHERE id = ?5 AND status IN ('init', 'pending')
           AND (external_id IS NULL OR external_id = ?1)",
        params![external_id, request_payload, response_payload, now(), id],
    )?;
    Ok(affected > 0)
}

/// Compare-and-swap the attempt status from `from` to `to`.
///
/// Returns:
/// - `Ok(true)` if this call performed the transition
/// - `Ok(false)` if the row was no longer in `from` (someone else moved it)
/// - `Err(Conflict)` if `from -> to` is not a legal transition
pub fn try_transition_attempt(
    conn: &Connection,
    id: &str,
    from: PaymentStatus,
    to: PaymentStatus,
) -> Result<bool> {
    if !from.can_transition_to(to) {
        return Err(AppError::Conflict(format!(
            "illegal payment transition {} -> {}",
            from.as_ref(),
            to.as_ref()
        )));
    }
    let affected = conn.execute(
        "UPDATE payment_attempts SET status = ?1, updated_at = ?2,
            needs_reconcile = CASE WHEN ?1 IN ('init', 'pending') THEN needs_reconcile ELSE 0 END
         WHERE id = ?3 AND status = ?4",
        params![to.as_ref(), now(), id, from.as_ref()],
    )?;
    Ok(affected > 0)
}

/// Capture details written together with a settling transition.
#[derive(Debug, Default)]
pub struct SettleFields<'a> {
    pub capture_id: Option<&'a str>,
    pub paid_at: Option<i64>,
    pub response_payload: Option<&'a str>,
    pub notify_payload: Option<&'a str>,
    pub notified_at: Option<i64>,
}

/// Compare-and-swap an attempt into SUCCESS, FAIL or EXCEPTION together with
/// its capture audit fields. Same return contract as `try_transition_attempt`.
pub fn try_settle_attempt(
    conn: &Connection,
    id: &str,
    from: PaymentStatus,
    to: PaymentStatus,
    fields: &SettleFields<'_>,
) -> Result<bool> {
    if !from.can_transition_to(to) || !to.is_terminal() {
        return Err(AppError::Conflict(format!(
            "illegal payment transition {} -> {}",
            from.as_ref(),
            to.as_ref()
        )));
    }
    let affected = conn.execute(
        "UPDATE payment_attempts SET status = ?1,
            capture_id = COALESCE(?2, capture_id),
            paid_at = COALESCE(?3, paid_at),
            response_payload = COALESCE(?4, response_payload),
            notify_payload = COALESCE(?5, notify_payload),
            last_notified_at = COALESCE(?6, last_notified_at),
            needs_reconcile = 0,
            updated_at = ?7
         WHERE id = ?8 AND status = ?9",
        params![
            to.as_ref(),
            fields.capture_id,
            fields.paid_at,
            fields.response_payload,
            fields.notify_payload,
            fields.notified_at,
            now(),
            id,
            from.as_ref()
        ],
    )?;
    Ok(affected > 0)
}

/// Record capture audit fields without changing status. A capture id already
/// on the row is never overwritten.
pub fn record_capture_audit(conn: &Connection, id: &str, fields: &SettleFields<'_>) -> Result<()> {
    conn.execute(
        "UPDATE payment_attempts SET
            capture_id = COALESCE(capture_id, ?1),
            response_payload = COALESCE(?2, response_payload),
            notify_payload = COALESCE(?3, notify_payload),
            last_notified_at = COALESCE(?4, last_notified_at),
            updated_at = ?5
         WHERE id = ?6",
        params![
            fields.capture_id,
            fields.response_payload,
            fields.notify_payload,
            fields.notified_at,
            now(),
            id
        ],
    )?;
    Ok(())
}

/// Record that the gateway was consulted for this attempt, whether or not
/// the call succeeded. Drives the reconciliation ordering.
pub fn mark_polled(
    conn: &Connection,
    id: &str,
    response_payload: Option<&str>,
    capture_id: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE payment_attempts SET last_polled_at = ?1,
            response_payload = COALESCE(?2, response_payload),
            capture_id = COALESCE(capture_id, ?3)
         WHERE id = ?4",
        params![now(), response_payload, capture_id, id],
    )?;
    Ok(())
}

/// Flag an attempt whose gateway-side outcome may not be reflected locally.
pub fn flag_for_reconcile(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE payment_attempts SET needs_reconcile = 1, updated_at = ?1 WHERE id = ?2",
        params![now(), id],
    )?;
    Ok(())
}

/// INIT/PENDING attempts bound to a gateway order, flagged ones first, then
/// never-polled, then least recently polled.
pub fn list_sync_candidates(conn: &Connection, limit: usize) -> Result<Vec<PaymentAttempt>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM payment_attempts
             WHERE status IN ('init', 'pending') AND external_id IS NOT NULL
             ORDER BY needs_reconcile DESC, COALESCE(last_polled_at, 0) ASC, created_at ASC
             LIMIT ?1",
            PAYMENT_ATTEMPT_COLS
        ),
        &[&(limit as i64)],
    )
}

// ============ Refund Attempts ============

pub fn get_refund_attempt(conn: &Connection, id: &str) -> Result<Option<RefundAttempt>> {
    query_one(
        conn,
        &format!("SELECT {} FROM refund_attempts WHERE id = ?1", REFUND_ATTEMPT_COLS),
        &[&id],
    )
}

pub fn get_refund_by_client_key(
    conn: &Connection,
    payment_id: &str,
    client_key: &str,
) -> Result<Option<RefundAttempt>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM refund_attempts WHERE payment_id = ?1 AND client_key = ?2",
            REFUND_ATTEMPT_COLS
        ),
        &[&payment_id, &client_key],
    )
}

pub fn get_refund_by_external_id(
    conn: &Connection,
    external_refund_id: &str,
) -> Result<Option<RefundAttempt>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM refund_attempts WHERE external_refund_id = ?1",
            REFUND_ATTEMPT_COLS
        ),
        &[&external_refund_id],
    )
}

pub fn list_refunds_for_payment(conn: &Connection, payment_id: &str) -> Result<Vec<RefundAttempt>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM refund_attempts WHERE payment_id = ?1 ORDER BY created_at, rowid",
            REFUND_ATTEMPT_COLS
        ),
        &[&payment_id],
    )
}

/// New refund row parameters.
#[derive(Debug)]
pub struct NewRefund<'a> {
    pub client_key: &'a str,
    pub external_refund_id: Option<&'a str>,
    pub capture_id: Option<&'a str>,
    pub amount_minor: i64,
    pub currency: &'a str,
    pub status: RefundStatus,
    pub reason: Option<&'a str>,
    pub response_payload: Option<&'a str>,
}

/// Insert a refund for the attempt, deduplicated by `(payment_id, client_key)`.
/// Returns the stored row and whether this call created it.
pub fn insert_refund_if_absent(
    conn: &Connection,
    attempt: &PaymentAttempt,
    refund: &NewRefund<'_>,
) -> Result<(RefundAttempt, bool)> {
    let id = EntityType::RefundAttempt.gen_id();
    let now = now();

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO refund_attempts
            (id, payment_id, order_id, client_key, external_refund_id, capture_id, amount_minor,
             currency, status, reason, response_payload, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
        params![
            &id,
            &attempt.id,
            &attempt.order_id,
            refund.client_key,
            refund.external_refund_id,
            refund.capture_id,
            refund.amount_minor,
            refund.currency,
            refund.status.as_ref(),
            refund.reason,
            refund.response_payload,
            now
        ],
    )? > 0;

    let stored = get_refund_by_client_key(conn, &attempt.id, refund.client_key)?
        .ok_or_else(|| AppError::Internal("refund row missing after insert".into()))?;
    Ok((stored, inserted))
}

/// Compare-and-swap a refund from `from` to `to`, recording the gateway refund id
/// (first one wins) and the raw response.
pub fn try_update_refund(
    conn: &Connection,
    id: &str,
    from: RefundStatus,
    to: RefundStatus,
    external_refund_id: Option<&str>,
    response_payload: Option<&str>,
) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE refund_attempts SET status = ?1,
            external_refund_id = COALESCE(external_refund_id, ?2),
            response_payload = COALESCE(?3, response_payload),
            updated_at = ?4
         WHERE id = ?5 AND status = ?6",
        params![to.as_ref(), external_refund_id, response_payload, now(), id, from.as_ref()],
    )?;
    Ok(affected > 0)
}

/// Touch an open refund so the refund scan rotates through the backlog.
pub fn touch_refund(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE refund_attempts SET updated_at = ?1 WHERE id = ?2",
        params![now(), id],
    )?;
    Ok(())
}

pub fn delete_refund_attempt(conn: &Connection, id: &str) -> Result<bool> {
    let affected = conn.execute("DELETE FROM refund_attempts WHERE id = ?1", params![id])?;
    Ok(affected > 0)
}

/// INIT/PENDING refunds this service issues, least recently touched first.
pub fn list_open_refunds(conn: &Connection, limit: usize) -> Result<Vec<RefundAttempt>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM refund_attempts
             WHERE status IN ('init', 'pending') AND client_key NOT LIKE 'ext-%'
             ORDER BY updated_at ASC, rowid ASC LIMIT ?1",
            REFUND_ATTEMPT_COLS
        ),
        &[&(limit as i64)],
    )
}

pub fn sum_successful_refunds(conn: &Connection, payment_id: &str) -> Result<i64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(amount_minor), 0) FROM refund_attempts WHERE payment_id = ?1 AND status = 'success'",
        params![payment_id],
        |row| row.get(0),
    )?;
    Ok(total)
}

// ============ Dedupe Keys ============

/// Atomically set `key` unless a live (unexpired) value exists.
///
/// An expired row is taken over in the same statement, so there is no window
/// between "expired" and "claimed" for a second caller to slip through.
pub fn try_set_dedupe_key(conn: &Connection, key: &str, value: &str, ttl_secs: i64) -> Result<bool> {
    let now = now();
    let affected = conn.execute(
        "INSERT INTO dedupe_keys (key, value, expires_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
         WHERE dedupe_keys.expires_at <= ?4",
        params![key, value, now + ttl_secs, now],
    )?;
    Ok(affected > 0)
}

pub fn get_dedupe_key(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM dedupe_keys WHERE key = ?1 AND expires_at > ?2",
            params![key, now()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub fn set_dedupe_key(conn: &Connection, key: &str, value: &str, ttl_secs: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO dedupe_keys (key, value, expires_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        params![key, value, now() + ttl_secs],
    )?;
    Ok(())
}

pub fn delete_dedupe_key(conn: &Connection, key: &str) -> Result<()> {
    conn.execute("DELETE FROM dedupe_keys WHERE key = ?1", params![key])?;
    Ok(())
}

/// Delete expired dedupe keys. Returns the number of deleted records.
pub fn purge_expired_dedupe_keys(conn: &Connection) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM dedupe_keys WHERE expires_at <= ?1",
        params![now()],
    )?;
    Ok(deleted)
}
