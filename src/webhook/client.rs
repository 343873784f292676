use std::time::{Duration, Instant};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{AppResult, DeliveryError};
use crate::queue::WebhookEvent;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_WEBHOOK_ID: &str = "X-Webhook-Id";
pub const HEADER_WEBHOOK_EVENT: &str = "X-Webhook-Event";
pub const HEADER_SIGNATURE: &str = "X-Webhook-Signature";

/// Longest slice of a rejection body kept for the audit trail
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookBody<'a> {
    event_type: &'a str,
    payload: &'a serde_json::Value,
}

/// Fully encoded notification. The body is encoded once per event, so every
/// redelivery sends identical bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRequest {
    pub log_id: Uuid,
    pub event_type: String,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn from_event(event: &WebhookEvent) -> AppResult<Self> {
        let body = serde_json::to_vec(&WebhookBody {
            event_type: &event.event_type,
            payload: &event.payload,
        })?;

        Ok(Self {
            log_id: event.log_id,
            event_type: event.event_type.clone(),
            body,
        })
    }
}

/// Successful delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub status_code: u16,
    pub duration: Duration,
}

/// Outbound delivery capability
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, url: &str, request: &WebhookRequest) -> Result<DeliveryReceipt, DeliveryError>;
}

/// `sha256=<hex>` HMAC of the raw body
pub fn sign(secret: &str, body: &[u8]) -> Result<String, DeliveryError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| DeliveryError::InvalidEndpoint(format!("invalid signing key: {}", e)))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpWebhookClient {
    client: reqwest::Client,
    timeout: Duration,
    signing_secret: Option<String>,
}

impl HttpWebhookClient {
    pub fn new(timeout: Duration, signing_secret: Option<String>) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DeliveryError::from)?;

        Ok(Self {
            client,
            timeout,
            signing_secret: signing_secret.filter(|secret| !secret.is_empty()),
        })
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookClient {
    async fn post(&self, url: &str, request: &WebhookRequest) -> Result<DeliveryReceipt, DeliveryError> {
        let mut builder = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(HEADER_WEBHOOK_ID, request.log_id.to_string())
            .header(HEADER_WEBHOOK_EVENT, request.event_type.as_str())
            .body(request.body.clone());

        if let Some(secret) = &self.signing_secret {
            builder = builder.header(HEADER_SIGNATURE, sign(secret, &request.body)?);
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout(self.timeout)
            } else {
                DeliveryError::from(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(DeliveryReceipt {
            status_code: status.as_u16(),
            duration: started.elapsed(),
        })
    }
}
