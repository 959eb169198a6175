use rusqlite::Connection;

/// Initialize the database schema.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    // WAL lets the reconciliation pass read while request workers write.
    // Writers are still serialized; see queries::lock_order.
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;

        -- Orders (owned by the order subsystem; the payment engine only
        -- writes status, pay_status, pay_channel, payment_external_id, pay_time)
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('created', 'pending_payment', 'paid', 'cancelled', 'closed', 'refunded')),
            pay_status TEXT NOT NULL DEFAULT 'none',
            pay_channel TEXT,
            payment_external_id TEXT,
            pay_time INTEGER,
            amount_minor INTEGER NOT NULL CHECK (amount_minor > 0),
            currency TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id);

        -- Payment attempts (one row per order/channel try)
        CREATE TABLE IF NOT EXISTS payment_attempts (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            channel TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('none', 'init', 'pending', 'success', 'fail', 'exception', 'closed')),
            external_id TEXT,
            capture_id TEXT,
            amount_minor INTEGER NOT NULL,
            currency TEXT NOT NULL,
            request_payload TEXT,
            response_payload TEXT,
            notify_payload TEXT,
            last_polled_at INTEGER,
            last_notified_at INTEGER,
            paid_at INTEGER,
            needs_reconcile INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_payment_attempts_order ON payment_attempts(order_id, status);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_payment_attempts_external
            ON payment_attempts(external_id) WHERE external_id IS NOT NULL;
        -- At most one settled attempt per order
        CREATE UNIQUE INDEX IF NOT EXISTS idx_payment_attempts_one_success
            ON payment_attempts(order_id) WHERE status = 'success';
        CREATE INDEX IF NOT EXISTS idx_payment_attempts_sync
            ON payment_attempts(status, last_polled_at) WHERE external_id IS NOT NULL;

        -- Refund attempts (money flowing back for a captured attempt)
        CREATE TABLE IF NOT EXISTS refund_attempts (
            id TEXT PRIMARY KEY,
            payment_id TEXT NOT NULL REFERENCES payment_attempts(id) ON DELETE CASCADE,
            order_id TEXT NOT NULL,
            client_key TEXT NOT NULL,
            external_refund_id TEXT,
            capture_id TEXT,
            amount_minor INTEGER NOT NULL,
            currency TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('init', 'pending', 'success', 'fail')),
            reason TEXT,
            response_payload TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(payment_id, client_key)
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_refund_attempts_external
            ON refund_attempts(external_refund_id) WHERE external_refund_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_refund_attempts_open ON refund_attempts(status, updated_at);

        -- Dedupe keys (webhook replay protection, TTL enforced on read)
        CREATE TABLE IF NOT EXISTS dedupe_keys (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_dedupe_keys_expiry ON dedupe_keys(expires_at);
        "#,
    )?;
    Ok(())
}
