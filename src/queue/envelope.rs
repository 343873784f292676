use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;
use crate::ledger::models::NewWebhookLog;

/// Named queues of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    PaymentProcessing,
    RefundProcessing,
    WebhookDelivery,
}

impl QueueName {
    pub fn all() -> [QueueName; 3] {
        [
            QueueName::PaymentProcessing,
            QueueName::RefundProcessing,
            QueueName::WebhookDelivery,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::PaymentProcessing => "payment-processing",
            QueueName::RefundProcessing => "refund-processing",
            QueueName::WebhookDelivery => "webhook-delivery",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = QueueError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        QueueName::all()
            .into_iter()
            .find(|queue| queue.as_str() == value)
            .ok_or_else(|| QueueError::UnknownQueue(value.to_string()))
    }
}

/// Notification event types sent to tenants
pub struct EventType;

impl EventType {
    pub const PAYMENT_COMPLETED: &'static str = "payment.completed";
    pub const PAYMENT_FAILED: &'static str = "payment.failed";
    pub const REFUND_COMPLETED: &'static str = "refund.completed";
    pub const REFUND_FAILED: &'static str = "refund.failed";
}

/// A notification waiting for delivery.
///
/// `log_id` is fixed when the event is produced, so every redelivery of the
/// envelope lands on the same WebhookLog row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub log_id: Uuid,
    pub tenant_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl WebhookEvent {
    pub fn new(
        tenant_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            log_id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            event_type: event_type.into(),
            payload,
        }
    }

    /// Notification about a settled entity. The log id is derived from the
    /// entity and the event type, so emitting the same outcome again lands on
    /// the same WebhookLog row and carries the same `X-Webhook-Id`.
    pub fn for_entity(
        tenant_id: impl Into<String>,
        event_type: impl Into<String>,
        entity_id: &str,
        payload: serde_json::Value,
    ) -> Self {
        let event_type = event_type.into();
        let name = format!("{}:{}", event_type, entity_id);

        Self {
            log_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()),
            tenant_id: tenant_id.into(),
            event_type,
            payload,
        }
    }

    pub fn to_log(&self) -> NewWebhookLog {
        NewWebhookLog {
            id: self.log_id,
            tenant_id: self.tenant_id.clone(),
            event_type: self.event_type.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Queued work. Entity jobs carry references only; the worker re-reads the
/// current row when it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Payment { payment_id: String },
    Refund { refund_id: String },
    Webhook(WebhookEvent),
}

impl JobPayload {
    /// The only queue this payload may be placed on
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::Payment { .. } => QueueName::PaymentProcessing,
            JobPayload::Refund { .. } => QueueName::RefundProcessing,
            JobPayload::Webhook(_) => QueueName::WebhookDelivery,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::Payment { .. } => "payment",
            JobPayload::Refund { .. } => "refund",
            JobPayload::Webhook(_) => "webhook",
        }
    }
}

/// Producer overrides applied at enqueue time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Defaults to the queue's retry policy
    pub max_attempts: Option<u32>,
    /// Hold the envelope back before its first delivery
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            delay: None,
        }
    }
}

/// One delivery of a job, as handed to a consumer.
///
/// `attempts` counts deliveries including this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: Uuid,
    pub queue: QueueName,
    pub payload: JobPayload,
    pub attempts: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl JobEnvelope {
    /// Delivered more times than its budget allows (e.g. reclaimed after a
    /// crash on its final attempt)
    pub fn is_exhausted(&self) -> bool {
        self.attempts > self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_names_parse() {
        for queue in QueueName::all() {
            assert_eq!(queue.as_str().parse::<QueueName>().unwrap(), queue);
        }
        assert!(matches!(
            "email".parse::<QueueName>(),
            Err(QueueError::UnknownQueue(_))
        ));
    }

    #[test]
    fn test_payload_is_tagged() {
        let payload = JobPayload::Payment {
            payment_id: "pay_1".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "payment");
        assert_eq!(json["payment_id"], "pay_1");

        let event = WebhookEvent::new("t_1", EventType::PAYMENT_COMPLETED, serde_json::json!({}));
        let json = serde_json::to_value(JobPayload::Webhook(event.clone())).unwrap();
        assert_eq!(json["kind"], "webhook");
        assert_eq!(json["event_type"], "payment.completed");

        let back: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, JobPayload::Webhook(event));
    }

    #[test]
    fn test_entity_event_log_id_is_stable() {
        let first = WebhookEvent::for_entity("t_1", EventType::PAYMENT_COMPLETED, "pay_1", serde_json::json!({}));
        let again = WebhookEvent::for_entity("t_1", EventType::PAYMENT_COMPLETED, "pay_1", serde_json::json!({}));
        let failed = WebhookEvent::for_entity("t_1", EventType::PAYMENT_FAILED, "pay_1", serde_json::json!({}));

        assert_eq!(first.log_id, again.log_id);
        assert_ne!(first.log_id, failed.log_id);
    }

    #[test]
    fn test_payload_routes_to_its_queue() {
        assert_eq!(
            JobPayload::Refund {
                refund_id: "rfnd_1".into()
            }
            .queue(),
            QueueName::RefundProcessing
        );
    }
}
