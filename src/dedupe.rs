//! TTL key-value store used for webhook replay protection.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::db::{DbPool, queries};
use crate::error::{AppError, Result};

/// TTL-capable key-value capability. Keys are scoped by the caller; the store
/// never interprets them.
pub trait DedupeStore: Send + Sync {
    /// Atomically set `key` only if no live value exists. Returns whether this
    /// call set it.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Live value for `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditionally set `key`.
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    /// Drop expired entries. Returns how many were removed.
    fn purge_expired(&self) -> Result<usize>;
}

/// Dedupe store backed by the `dedupe_keys` table.
#[derive(Clone)]
pub struct SqliteDedupeStore {
    pool: DbPool,
}

impl SqliteDedupeStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    // Sub-second TTLs still need to outlive the current second
    ttl.as_secs().max(1) as i64
}

impl DedupeStore for SqliteDedupeStore {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let conn = self.pool.get()?;
        queries::try_set_dedupe_key(&conn, key, value, ttl_secs(ttl))
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        queries::get_dedupe_key(&conn, key)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let conn = self.pool.get()?;
        queries::set_dedupe_key(&conn, key, value, ttl_secs(ttl))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.pool.get()?;
        queries::delete_dedupe_key(&conn, key)
    }

    fn purge_expired(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        queries::purge_expired_dedupe_keys(&conn)
    }
}

/// Process-local dedupe store. Only correct for a single instance.
#[derive(Default)]
pub struct InMemoryDedupeStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryDedupeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>> {
        self.entries
            .lock()
            .map_err(|_| AppError::Internal("dedupe store lock poisoned".into()))
    }
}

impl DedupeStore for InMemoryDedupeStore {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        if let Some((_, expires_at)) = entries.get(key)
            && *expires_at > now
        {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.lock()?;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.lock()?;
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize> {
        let mut entries = self.lock()?;
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(before - entries.len())
    }
}
