//! Row mapping trait and helpers for reducing boilerplate in queries.
//!
//! Models implement `FromRow` to define how they are constructed from
//! database rows; `query_one` and `query_all` cover the common patterns.

use rusqlite::{Connection, OptionalExtension, Row, ToSql};

use crate::models::*;

/// Parse a string column into an enum type, converting parse errors to rusqlite errors.
///
/// Unknown enum values (from corruption or a newer writer) surface as errors
/// instead of panics.
fn parse_enum<T: std::str::FromStr>(row: &Row, col: usize, col_name: &str) -> rusqlite::Result<T> {
    row.get::<_, String>(col)?.parse::<T>().map_err(|_| {
        rusqlite::Error::InvalidColumnType(col, col_name.to_string(), rusqlite::types::Type::Text)
    })
}

fn parse_optional_enum<T: std::str::FromStr>(
    row: &Row,
    col: usize,
    col_name: &str,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(col)? {
        Some(s) => s.parse::<T>().map(Some).map_err(|_| {
            rusqlite::Error::InvalidColumnType(col, col_name.to_string(), rusqlite::types::Type::Text)
        }),
        None => Ok(None),
    }
}

/// Trait for constructing a type from a database row.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

/// Query for a single optional result.
pub fn query_one<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Option<T>> {
    conn.query_row(sql, params, T::from_row)
        .optional()
        .map_err(Into::into)
}

/// Query for multiple results.
pub fn query_all<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, T::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============ SQL SELECT Constants ============

pub const ORDER_COLS: &str = "id, user_id, status, pay_status, pay_channel, payment_external_id, pay_time, amount_minor, currency, created_at, updated_at";

pub const PAYMENT_ATTEMPT_COLS: &str = "id, order_id, channel, status, external_id, capture_id, amount_minor, currency, request_payload, response_payload, notify_payload, last_polled_at, last_notified_at, paid_at, needs_reconcile, created_at, updated_at";

pub const REFUND_ATTEMPT_COLS: &str = "id, payment_id, order_id, client_key, external_refund_id, capture_id, amount_minor, currency, status, reason, response_payload, created_at, updated_at";

// ============ FromRow Implementations ============

impl FromRow for Order {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Order {
            id: row.get(0)?,
            user_id: row.get(1)?,
            status: parse_enum(row, 2, "status")?,
            pay_status: parse_enum(row, 3, "pay_status")?,
            pay_channel: parse_optional_enum(row, 4, "pay_channel")?,
            payment_external_id: row.get(5)?,
            pay_time: row.get(6)?,
            amount_minor: row.get(7)?,
            currency: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}

impl FromRow for PaymentAttempt {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(PaymentAttempt {
            id: row.get(0)?,
            order_id: row.get(1)?,
            channel: parse_enum(row, 2, "channel")?,
            status: parse_enum(row, 3, "status")?,
            external_id: row.get(4)?,
            capture_id: row.get(5)?,
            amount_minor: row.get(6)?,
            currency: row.get(7)?,
            request_payload: row.get(8)?,
            response_payload: row.get(9)?,
            notify_payload: row.get(10)?,
            last_polled_at: row.get(11)?,
            last_notified_at: row.get(12)?,
            paid_at: row.get(13)?,
            needs_reconcile: row.get::<_, i32>(14)? != 0,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
        })
    }
}

impl FromRow for RefundAttempt {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(RefundAttempt {
            id: row.get(0)?,
            payment_id: row.get(1)?,
            order_id: row.get(2)?,
            client_key: row.get(3)?,
            external_refund_id: row.get(4)?,
            capture_id: row.get(5)?,
            amount_minor: row.get(6)?,
            currency: row.get(7)?,
            status: parse_enum(row, 8, "status")?,
            reason: row.get(9)?,
            response_payload: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }
}
