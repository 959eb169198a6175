//! Webhook admission: replay protection, clock skew and signature checks.
//!
//! Two markers per delivery, keyed by transmission id and event id. The
//! short-lived in-flight marker stops concurrent duplicates; the long-lived
//! done marker is written only after processing succeeded, so a delivery that
//! failed half way is retried by the sender instead of being swallowed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::PaymentSettings;
use crate::db::AppState;
use crate::dedupe::DedupeStore;
use crate::error::{AppError, Result, msg};
use crate::gateway::{PaymentGateway, WebhookHeaders};

/// Marker keys held by an admitted delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookTicket {
    pub inflight_key: String,
    pub done_key: String,
}

impl WebhookTicket {
    pub fn new(transmission_id: &str, event_id: &str) -> Self {
        Self {
            inflight_key: format!("webhook:inflight:{}:{}", transmission_id, event_id),
            done_key: format!("webhook:done:{}:{}", transmission_id, event_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Verified and claimed. The caller must `complete` or `abandon` it.
    ShouldProcess(WebhookTicket),
    AlreadyProcessed,
    /// Another delivery of the same event is being processed right now.
    Processing,
}

pub struct WebhookGate {
    store: Arc<dyn DedupeStore>,
    gateway: Arc<dyn PaymentGateway>,
    clock_skew: Duration,
    inflight_ttl: Duration,
    done_ttl: Duration,
}

impl WebhookGate {
    pub fn new(
        store: Arc<dyn DedupeStore>,
        gateway: Arc<dyn PaymentGateway>,
        settings: &PaymentSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            clock_skew: settings.clock_skew,
            inflight_ttl: settings.webhook_inflight_ttl,
            done_ttl: settings.webhook_done_ttl,
        }
    }

    pub fn from_state(state: &AppState) -> Self {
        Self::new(state.dedupe.clone(), state.gateway.clone(), &state.settings)
    }

    /// Decide whether a delivery should be processed.
    ///
    /// Returns `Err(ReplayRejected)` for a transmission time outside the
    /// allowed skew and `Err(Unauthorized)` for a bad signature. Neither
    /// rejection marks the event processed.
    pub async fn admit(&self, headers: &WebhookHeaders, event_id: &str, body: &[u8]) -> Result<Admission> {
        let ticket = WebhookTicket::new(&headers.transmission_id, event_id);

        if self.store.get(&ticket.done_key)?.is_some() {
            tracing::debug!("Webhook {} already processed", ticket.done_key);
            return Ok(Admission::AlreadyProcessed);
        }

        if !self.store.set_if_absent(&ticket.inflight_key, "processing", self.inflight_ttl)? {
            // The holder may have finished between the two reads
            if self.store.get(&ticket.done_key)?.is_some() {
                return Ok(Admission::AlreadyProcessed);
            }
            tracing::debug!("Webhook {} is being processed elsewhere", ticket.inflight_key);
            return Ok(Admission::Processing);
        }

        if let Err(e) = self.verify(headers, body).await {
            self.abandon(&ticket);
            return Err(e);
        }

        Ok(Admission::ShouldProcess(ticket))
    }

    async fn verify(&self, headers: &WebhookHeaders, body: &[u8]) -> Result<()> {
        let sent_at = headers.transmission_timestamp()?;
        let skew = (Utc::now().timestamp() - sent_at).abs();
        if skew > self.clock_skew.as_secs() as i64 {
            tracing::warn!(
                "Webhook {} rejected: transmission time {}s from now",
                headers.transmission_id,
                skew
            );
            return Err(AppError::ReplayRejected(msg::STALE_WEBHOOK.into()));
        }

        if !self.gateway.verify_signature(headers, body).await? {
            tracing::warn!("Webhook {} rejected: invalid signature", headers.transmission_id);
            return Err(AppError::Unauthorized);
        }
        Ok(())
    }

    /// Mark the delivery processed. Later deliveries of the same event are
    /// answered without processing.
    pub fn complete(&self, ticket: &WebhookTicket) -> Result<()> {
        self.store.set(&ticket.done_key, "done", self.done_ttl)?;
        if let Err(e) = self.store.delete(&ticket.inflight_key) {
            tracing::warn!("Failed to clear {}: {}", ticket.inflight_key, e);
        }
        Ok(())
    }

    /// Release the in-flight marker so a retry can process the event.
    pub fn abandon(&self, ticket: &WebhookTicket) {
        if let Err(e) = self.store.delete(&ticket.inflight_key) {
            tracing::warn!(
                "Failed to release {}, retries blocked until it expires: {}",
                ticket.inflight_key,
                e
            );
        }
    }
}
