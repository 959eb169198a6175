//! Webhook event dispatch.
//!
//! Events are admitted by the [`WebhookGate`], matched to a local attempt by
//! gateway order id, and then fed into the same capture and refund paths the
//! user flow and the scanner use.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::{AppState, queries};
use crate::error::{AppError, Result, msg};
use crate::gateway::{WebhookHeaders, parse_gateway_time};
use crate::models::{CaptureSource, PaymentAttempt};

use super::capture::{self, ApplyCaptureCommand};
use super::refund::{self, RefundNotice};
use super::webhook::{Admission, WebhookGate};

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    #[serde(default)]
    pub resource: Value,
    pub create_time: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    OrderApproved,
    CaptureCompleted,
    CaptureDenied,
    CaptureRefunded,
    Other,
}

impl EventKind {
    pub fn from_event_type(event_type: &str) -> Self {
        match event_type {
            "CHECKOUT.ORDER.APPROVED" => Self::OrderApproved,
            "PAYMENT.CAPTURE.COMPLETED" => Self::CaptureCompleted,
            "PAYMENT.CAPTURE.DECLINED" | "PAYMENT.CAPTURE.DENIED" => Self::CaptureDenied,
            "PAYMENT.CAPTURE.REFUNDED" | "PAYMENT.CAPTURE.REVERSED" => Self::CaptureRefunded,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookOutcome {
    Processed,
    /// Well-formed but not actionable (unknown order, unhandled event type).
    Ignored,
    AlreadyProcessed,
    Processing,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "PROCESSED",
            Self::Ignored => "IGNORED",
            Self::AlreadyProcessed => "ALREADY_PROCESSED",
            Self::Processing => "PROCESSING",
        }
    }
}

// ============ Order id extraction ============

type OrderIdExtractor = fn(&Value) -> Option<String>;

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn resource_id(resource: &Value) -> Option<String> {
    resource.get("id").and_then(Value::as_str).and_then(non_empty)
}

fn related_order_id(resource: &Value) -> Option<String> {
    resource
        .pointer("/supplementary_data/related_ids/order_id")
        .and_then(Value::as_str)
        .and_then(non_empty)
}

/// Order id from the `up` link, e.g. `.../v2/checkout/orders/EC-1`.
fn order_up_link(resource: &Value) -> Option<String> {
    resource
        .get("links")?
        .as_array()?
        .iter()
        .filter(|link| link.get("rel").and_then(Value::as_str) == Some("up"))
        .filter_map(|link| link.get("href").and_then(Value::as_str))
        .find_map(|href| {
            let (_, rest) = href.split_once("/checkout/orders/")?;
            rest.split(['/', '?']).next().and_then(non_empty)
        })
}

const ORDER_EVENT_EXTRACTORS: &[OrderIdExtractor] = &[resource_id];
const CAPTURE_EVENT_EXTRACTORS: &[OrderIdExtractor] = &[related_order_id, order_up_link, resource_id];

fn extractors_for(event_type: &str) -> &'static [OrderIdExtractor] {
    if event_type.starts_with("CHECKOUT.ORDER.") {
        ORDER_EVENT_EXTRACTORS
    } else {
        CAPTURE_EVENT_EXTRACTORS
    }
}

/// Gateway order id an event refers to. Strategies are tried in order and
/// the first hit wins.
pub fn extract_order_id(event: &WebhookEvent) -> Option<String> {
    extractors_for(&event.event_type)
        .iter()
        .find_map(|extract| extract(&event.resource))
}

// ============ Dispatch ============

/// Verify, deduplicate and process one webhook delivery.
pub async fn handle_webhook(state: &AppState, headers: &WebhookHeaders, body: &[u8]) -> Result<WebhookOutcome> {
    let event: WebhookEvent = serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("{}: {}", msg::INVALID_WEBHOOK_PAYLOAD, e)))?;
    if event.id.trim().is_empty() || event.event_type.trim().is_empty() {
        return Err(AppError::BadRequest(msg::INVALID_WEBHOOK_PAYLOAD.into()));
    }

    let gate = WebhookGate::from_state(state);
    let ticket = match gate.admit(headers, &event.id, body).await? {
        Admission::ShouldProcess(ticket) => ticket,
        Admission::AlreadyProcessed => return Ok(WebhookOutcome::AlreadyProcessed),
        Admission::Processing => return Ok(WebhookOutcome::Processing),
    };

    match dispatch(state, &event, body).await {
        Ok(outcome) => {
            if let Err(e) = gate.complete(&ticket) {
                tracing::warn!("Webhook {} processed but not marked done: {}", event.id, e);
            }
            Ok(outcome)
        }
        Err(e) => {
            tracing::warn!("Webhook {} ({}) failed: {}", event.id, event.event_type, e);
            gate.abandon(&ticket);
            Err(e)
        }
    }
}

async fn dispatch(state: &AppState, event: &WebhookEvent, body: &[u8]) -> Result<WebhookOutcome> {
    let kind = EventKind::from_event_type(&event.event_type);
    if kind == EventKind::Other {
        tracing::debug!("Ignoring webhook event type {}", event.event_type);
        return Ok(WebhookOutcome::Ignored);
    }

    let Some(external_id) = extract_order_id(event) else {
        tracing::warn!("Webhook {} ({}) has no order id", event.id, event.event_type);
        return Ok(WebhookOutcome::Ignored);
    };

    let attempt = {
        let conn = state.db.get()?;
        queries::get_payment_attempt_by_external_id(&conn, &external_id)?
    };
    let Some(attempt) = attempt else {
        tracing::warn!(
            "Webhook {} references unknown gateway order {}",
            event.id,
            external_id
        );
        return Ok(WebhookOutcome::Ignored);
    };

    let raw = String::from_utf8_lossy(body).into_owned();
    let result = match kind {
        EventKind::OrderApproved => on_order_approved(state, &attempt).await,
        EventKind::CaptureCompleted | EventKind::CaptureDenied => {
            on_capture(state, event, &attempt, external_id, kind == EventKind::CaptureCompleted, raw).await
        }
        EventKind::CaptureRefunded => {
            let notice = RefundNotice::from_resource(&event.resource, raw)?;
            let mut conn = state.db.get()?;
            refund::apply_refund_notification(&mut conn, &attempt, &notice).map(|_| ())
        }
        EventKind::Other => return Ok(WebhookOutcome::Ignored),
    };

    match result {
        Ok(()) => Ok(WebhookOutcome::Processed),
        // Local state already moved past what the event describes
        Err(AppError::Conflict(reason)) => {
            tracing::info!("Webhook {} not applied to attempt {}: {}", event.id, attempt.id, reason);
            Ok(WebhookOutcome::Ignored)
        }
        Err(e) => Err(e),
    }
}

async fn on_order_approved(state: &AppState, attempt: &PaymentAttempt) -> Result<()> {
    if !attempt.status.is_active() {
        tracing::info!(
            "Buyer approved attempt {} but it is {}, not capturing",
            attempt.id,
            attempt.status.as_ref()
        );
        return Ok(());
    }
    capture::capture_attempt(state, None, &attempt.id, CaptureSource::Webhook).await?;
    Ok(())
}

async fn on_capture(
    state: &AppState,
    event: &WebhookEvent,
    attempt: &PaymentAttempt,
    external_id: String,
    success: bool,
    raw: String,
) -> Result<()> {
    let resource = &event.resource;
    let capture_time = resource
        .get("update_time")
        .or_else(|| resource.get("create_time"))
        .and_then(Value::as_str)
        .or(event.create_time.as_deref())
        .and_then(parse_gateway_time);

    let cmd = ApplyCaptureCommand {
        attempt_id: attempt.id.clone(),
        order_id: attempt.order_id.clone(),
        external_id: Some(external_id),
        success,
        capture_id: resource_id(resource),
        capture_time,
        freshness_window_secs: state.settings.freshness_window_secs(),
        raw_payload: Some(raw),
        source: CaptureSource::Webhook,
    };
    capture::apply_and_follow_up(state, &cmd).await?;
    Ok(())
}
