//! Process-wide access token cache with single-flight refresh.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::GatewayError;

/// Tokens are refreshed this long before the gateway would expire them.
const DEFAULT_MARGIN: Duration = Duration::from_secs(30);

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Cached bearer token guarded by an async mutex.
///
/// The lock is held across the refresh call, so concurrent callers that find
/// the token stale queue behind the one refresh in flight and then reuse its
/// result instead of each fetching a token.
pub struct TokenCache {
    state: Mutex<Option<CachedToken>>,
    margin: Duration,
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(DEFAULT_MARGIN)
    }
}

impl TokenCache {
    pub fn new(margin: Duration) -> Self {
        Self {
            state: Mutex::new(None),
            margin,
        }
    }

    /// Return the cached token, or run `fetch` to obtain a new one.
    ///
    /// `fetch` resolves to `(token, expires_in)`. Only one `fetch` runs at a
    /// time; a failed fetch leaves the cache empty so the next caller retries.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<String, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, Duration), GatewayError>>,
    {
        let mut guard = self.state.lock().await;

        if let Some(token) = guard.as_ref()
            && token.expires_at > Instant::now() + self.margin
        {
            return Ok(token.value.clone());
        }

        let (value, expires_in) = fetch().await?;
        tracing::debug!("Gateway access token refreshed (expires in {}s)", expires_in.as_secs());
        *guard = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + expires_in,
        });
        Ok(value)
    }

    /// Drop the cached token, e.g. after the gateway rejected it.
    pub async fn invalidate(&self) {
        *self.state.lock().await = None;
    }
}
