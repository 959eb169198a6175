use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::config::GatewayConfig;
use crate::models::PaymentChannel;

use super::{
    CaptureCommand, CaptureInfo, CaptureStatus, CreateOrderCommand, CreatedOrder, GatewayError,
    GatewayOrder, GatewayOrderStatus, PaymentGateway, RefundCommand, RefundResult, TokenCache,
    WebhookHeaders, format_minor, parse_gateway_time,
};

/// Header carrying the idempotency key on every write request.
const REQUEST_ID_HEADER: &str = "PayPal-Request-Id";

/// Applied when the token response omits `expires_in`.
const DEFAULT_TOKEN_TTL_SECS: u64 = 300;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LinkDescription {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct CaptureResource {
    id: String,
    status: String,
    create_time: Option<String>,
    update_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Payments {
    #[serde(default)]
    captures: Vec<CaptureResource>,
}

#[derive(Debug, Deserialize)]
struct PurchaseUnit {
    #[serde(default)]
    payments: Option<Payments>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    status: String,
    #[serde(default)]
    links: Vec<LinkDescription>,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnit>,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: Option<String>,
    status: String,
}

#[derive(Debug, Deserialize)]
struct VerifySignatureResponse {
    verification_status: String,
}

impl OrderResponse {
    fn approve_url(&self) -> Option<String> {
        self.links
            .iter()
            .find(|l| l.rel == "approve" || l.rel == "payer-action")
            .map(|l| l.href.clone())
    }

    /// Latest capture across purchase units.
    fn latest_capture(&self) -> Option<CaptureInfo> {
        self.purchase_units
            .iter()
            .filter_map(|u| u.payments.as_ref())
            .flat_map(|p| p.captures.iter())
            .last()
            .map(|c| CaptureInfo {
                capture_id: c.id.clone(),
                status: CaptureStatus::parse(&c.status),
                captured_at: c
                    .update_time
                    .as_deref()
                    .or(c.create_time.as_deref())
                    .and_then(parse_gateway_time),
            })
    }

    fn into_gateway_order(self, raw: String) -> GatewayOrder {
        GatewayOrder {
            status: GatewayOrderStatus::parse(&self.status),
            approve_url: self.approve_url(),
            capture: self.latest_capture(),
            external_id: self.id,
            raw,
        }
    }
}

/// Gateway adapter for the PayPal Orders v2 API.
///
/// Stateless apart from the shared access token cache.
pub struct PayPalGateway {
    client: Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    webhook_id: String,
    tokens: TokenCache,
}

impl PayPalGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::transport("client", e))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            webhook_id: config.webhook_id.clone(),
            tokens: TokenCache::default(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn fetch_token(&self) -> Result<(String, Duration), GatewayError> {
        let response = self
            .client
            .post(self.url("/v1/oauth2/token"))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest("token", e))?;

        let (_, token): (String, TokenResponse) = read_json("token", response).await?;
        let ttl = token.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS);
        Ok((token.access_token, Duration::from_secs(ttl)))
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        self.tokens.get_or_refresh(|| self.fetch_token()).await
    }

    /// Send an authorized request and decode the JSON body, keeping the raw text.
    async fn send<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<(String, T), GatewayError> {
        let token = self.access_token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(operation, e))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }

        read_json(operation, response).await
    }
}

async fn read_json<T: DeserializeOwned>(
    operation: &'static str,
    response: Response,
) -> Result<(String, T), GatewayError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| GatewayError::from_reqwest(operation, e))?;

    if !status.is_success() {
        tracing::warn!("Gateway {} returned {}: {}", operation, status.as_u16(), body);
        return Err(GatewayError::http(operation, status.as_u16(), body));
    }

    let parsed = serde_json::from_str(&body)
        .map_err(|e| GatewayError::decode(operation, status.as_u16(), e))?;
    Ok((body, parsed))
}

#[async_trait]
impl PaymentGateway for PayPalGateway {
    fn channel(&self) -> PaymentChannel {
        PaymentChannel::ExternalWallet
    }

    async fn create_order(&self, cmd: &CreateOrderCommand) -> Result<CreatedOrder, GatewayError> {
        let mut body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": cmd.reference_id,
                "custom_id": cmd.reference_id,
                "amount": {
                    "currency_code": cmd.currency,
                    "value": format_minor(cmd.amount_minor, &cmd.currency),
                },
            }],
        });
        if cmd.return_url.is_some() || cmd.cancel_url.is_some() {
            body["application_context"] = json!({
                "return_url": cmd.return_url,
                "cancel_url": cmd.cancel_url,
                "user_action": "PAY_NOW",
            });
        }

        let request = self
            .client
            .post(self.url("/v2/checkout/orders"))
            .header(REQUEST_ID_HEADER, &cmd.idempotency_key)
            .json(&body);

        let (raw, order): (String, OrderResponse) = self.send("create_order", request).await?;
        tracing::info!(
            "Gateway order {} created for attempt {}",
            order.id,
            cmd.reference_id
        );
        Ok(CreatedOrder {
            approve_url: order.approve_url(),
            external_id: order.id,
            raw,
        })
    }

    async fn get_order(&self, external_id: &str) -> Result<GatewayOrder, GatewayError> {
        let request = self
            .client
            .get(self.url(&format!("/v2/checkout/orders/{}", external_id)));

        let (raw, order): (String, OrderResponse) = self.send("get_order", request).await?;
        Ok(order.into_gateway_order(raw))
    }

    async fn capture(&self, cmd: &CaptureCommand) -> Result<GatewayOrder, GatewayError> {
        let request = self
            .client
            .post(self.url(&format!("/v2/checkout/orders/{}/capture", cmd.external_id)))
            .header(REQUEST_ID_HEADER, &cmd.idempotency_key)
            .json(&json!({}));

        let (raw, order): (String, OrderResponse) = self.send("capture", request).await?;
        Ok(order.into_gateway_order(raw))
    }

    async fn refund(&self, cmd: &RefundCommand) -> Result<RefundResult, GatewayError> {
        let mut body = json!({
            "amount": {
                "currency_code": cmd.currency,
                "value": format_minor(cmd.amount_minor, &cmd.currency),
            },
        });
        if let Some(note) = &cmd.note {
            body["note_to_payer"] = json!(note);
        }

        let request = self
            .client
            .post(self.url(&format!("/v2/payments/captures/{}/refund", cmd.capture_id)))
            .header(REQUEST_ID_HEADER, &cmd.idempotency_key)
            .json(&body);

        let (raw, refund): (String, RefundResponse) = self.send("refund", request).await?;
        Ok(RefundResult {
            refund_id: refund.id,
            status: refund.status,
            raw,
        })
    }

    async fn verify_signature(
        &self,
        headers: &WebhookHeaders,
        body: &[u8],
    ) -> Result<bool, GatewayError> {
        if self.webhook_id.is_empty() {
            tracing::error!("Webhook id not configured, rejecting webhook");
            return Ok(false);
        }

        // The verification call needs the event as JSON, not as a string
        let event: serde_json::Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Webhook body is not valid JSON: {}", e);
                return Ok(false);
            }
        };

        let request = self
            .client
            .post(self.url("/v1/notifications/verify-webhook-signature"))
            .json(&json!({
                "auth_algo": headers.auth_algo,
                "cert_url": headers.cert_url,
                "transmission_id": headers.transmission_id,
                "transmission_sig": headers.transmission_sig,
                "transmission_time": headers.transmission_time,
                "webhook_id": self.webhook_id,
                "webhook_event": event,
            }));

        let (_, result): (String, VerifySignatureResponse) =
            self.send("verify_signature", request).await?;
        Ok(result.verification_status.eq_ignore_ascii_case("SUCCESS"))
    }
}
