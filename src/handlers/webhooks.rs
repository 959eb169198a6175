use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};

use crate::db::AppState;
use crate::gateway::WebhookHeaders;
use crate::payments::{WebhookOutcome, handle_webhook};

/// Seconds the sender should wait before redelivering an event that is
/// still being processed.
const PROCESSING_RETRY_AFTER_SECS: &str = "30";

/// Gateway webhook endpoint.
///
/// 200 for processed, ignored and already-processed events; 503 with
/// `Retry-After` while a duplicate is in flight; 401 for bad signatures and
/// stale transmissions. Everything else maps through `AppError`, so failed
/// processing returns a non-2xx and the sender retries.
pub async fn handle_gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = match WebhookHeaders::from_header_map(&headers) {
        Ok(h) => h,
        Err(e) => return e.into_response(),
    };

    match handle_webhook(&state, &signature, &body).await {
        Ok(WebhookOutcome::Processing) => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, PROCESSING_RETRY_AFTER_SECS)],
            WebhookOutcome::Processing.as_str(),
        )
            .into_response(),
        Ok(outcome) => (StatusCode::OK, outcome.as_str()).into_response(),
        Err(e) => e.into_response(),
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/webhooks/gateway", post(handle_gateway_webhook))
}
