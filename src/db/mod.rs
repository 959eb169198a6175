mod from_row;
mod schema;
pub mod queries;

pub use schema::init_db;

use std::sync::Arc;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::config::PaymentSettings;
use crate::dedupe::DedupeStore;
use crate::gateway::PaymentGateway;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Shared state for request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub gateway: Arc<dyn PaymentGateway>,
    /// Webhook replay markers
    pub dedupe: Arc<dyn DedupeStore>,
    pub settings: PaymentSettings,
}

pub fn create_pool(database_path: &str) -> Result<DbPool, r2d2::Error> {
    // Writers queue on the database lock instead of failing with SQLITE_BUSY
    let manager = SqliteConnectionManager::file(database_path)
        .with_init(|conn| conn.busy_timeout(Duration::from_secs(5)));
    Pool::builder().max_size(10).build(manager)
}
