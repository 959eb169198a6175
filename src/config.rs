use std::env;
use std::time::Duration;

/// Upper bound for a single reconciliation batch.
pub const MAX_RECONCILE_BATCH: usize = 200;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub gateway: GatewayConfig,
    pub payments: PaymentSettings,
    /// How often the background reconciliation pass runs.
    pub reconcile_interval: Duration,
}

/// Credentials and endpoint for the payment gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Webhook id registered with the gateway, required for signature verification.
    pub webhook_id: String,
    pub timeout: Duration,
}

/// Payment policy shared by the checkout, capture, webhook and reconciliation paths.
#[derive(Debug, Clone)]
pub struct PaymentSettings {
    /// Late-payment cutoff measured from order creation. `None` disables it.
    pub freshness_window: Option<Duration>,
    /// Maximum allowed distance between a webhook's transmission time and now.
    pub clock_skew: Duration,
    /// Lifetime of the "being processed" webhook marker.
    pub webhook_inflight_ttl: Duration,
    /// Lifetime of the "done" webhook marker. Outlives the sender's retry window.
    pub webhook_done_ttl: Duration,
    pub reconcile_batch_size: usize,
    /// Approval page used when the gateway order no longer carries an approve link.
    pub approve_url_base: String,
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            freshness_window: None,
            clock_skew: Duration::from_secs(300),
            webhook_inflight_ttl: Duration::from_secs(300),
            webhook_done_ttl: Duration::from_secs(4 * 86400),
            reconcile_batch_size: 50,
            approve_url_base: "https://www.sandbox.paypal.com/checkoutnow?token=".to_string(),
        }
    }
}

impl PaymentSettings {
    /// Freshness window in whole seconds, if configured.
    pub fn freshness_window_secs(&self) -> Option<i64> {
        self.freshness_window.map(|w| w.as_secs() as i64)
    }
}

/// Clamp a requested batch size into `1..=MAX_RECONCILE_BATCH`.
pub fn clamp_batch(limit: usize) -> usize {
    limit.clamp(1, MAX_RECONCILE_BATCH)
}

fn env_secs(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);

        let defaults = PaymentSettings::default();

        // 0 or unset disables the late-payment cutoff
        let freshness_window = env_secs("PAYMENT_FRESHNESS_WINDOW_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let payments = PaymentSettings {
            freshness_window,
            clock_skew: env_secs("WEBHOOK_CLOCK_SKEW_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.clock_skew),
            webhook_inflight_ttl: env_secs("WEBHOOK_INFLIGHT_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.webhook_inflight_ttl),
            webhook_done_ttl: env_secs("WEBHOOK_DONE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.webhook_done_ttl),
            reconcile_batch_size: env::var("RECONCILE_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(clamp_batch)
                .unwrap_or(defaults.reconcile_batch_size),
            approve_url_base: env::var("GATEWAY_APPROVE_URL")
                .unwrap_or(defaults.approve_url_base),
        };

        let gateway = GatewayConfig {
            base_url: env::var("GATEWAY_BASE_URL")
                .unwrap_or_else(|_| "https://api-m.sandbox.paypal.com".to_string()),
            client_id: env::var("GATEWAY_CLIENT_ID").unwrap_or_default(),
            client_secret: env::var("GATEWAY_CLIENT_SECRET").unwrap_or_default(),
            webhook_id: env::var("GATEWAY_WEBHOOK_ID").unwrap_or_default(),
            timeout: Duration::from_secs(env_secs("GATEWAY_TIMEOUT_SECS").unwrap_or(15)),
        };

        if gateway.client_id.is_empty() || gateway.client_secret.is_empty() {
            tracing::warn!("GATEWAY_CLIENT_ID/GATEWAY_CLIENT_SECRET not set, gateway calls will fail");
        }

        Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "paysettle.db".to_string()),
            gateway,
            payments,
            reconcile_interval: Duration::from_secs(
                env_secs("RECONCILE_INTERVAL_SECS").unwrap_or(30 * 60),
            ),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
