use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, instrument, warn};

use super::client::{WebhookRequest, WebhookTransport};
use crate::error::DeliveryError;
use crate::ledger::models::{WebhookAttempt, WebhookStatus};
use crate::ledger::LedgerStore;
use crate::queue::{JobEnvelope, JobPayload, WebhookEvent};
use crate::worker::{JobError, JobHandler, WorkerRole};

pub const NOTE_TENANT_NOT_FOUND: &str = "tenant not found";
pub const NOTE_NO_ENDPOINT: &str = "no webhook endpoint configured";

/// Delivers notification events to tenant endpoints and keeps the audit trail
pub struct WebhookDispatchWorker {
    ledger: Arc<dyn LedgerStore>,
    transport: Arc<dyn WebhookTransport>,
    timeout: Duration,
}

impl WebhookDispatchWorker {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        transport: Arc<dyn WebhookTransport>,
        timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            transport,
            timeout,
        }
    }

    async fn dispatch(&self, event: &WebhookEvent) -> Result<(), JobError> {
        let log = event.to_log();
        let tenant = self.ledger.get_tenant(&event.tenant_id).await?;

        let Some(url) = tenant.as_ref().and_then(|tenant| tenant.endpoint()) else {
            let note = if tenant.is_none() {
                NOTE_TENANT_NOT_FOUND
            } else {
                NOTE_NO_ENDPOINT
            };
            self.ledger.record_webhook_skipped(&log, note).await?;
            info!(tenant_id = %event.tenant_id, log_id = %event.log_id, note, "Webhook skipped");
            return Ok(());
        };

        let request = WebhookRequest::from_event(event)?;
        let current = self.ledger.begin_webhook_attempt(&log).await?;

        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.transport.post(url, &request))
            .await
            .unwrap_or(Err(DeliveryError::Timeout(self.timeout)));
        let duration_ms = started.elapsed().as_millis() as i64;

        let attempt = match &result {
            Ok(receipt) => WebhookAttempt {
                log_id: event.log_id,
                attempt: current.attempts,
                status: WebhookStatus::Delivered,
                status_code: Some(i32::from(receipt.status_code)),
                error: None,
                duration_ms,
                attempted_at: Utc::now(),
            },
            Err(e) => WebhookAttempt {
                log_id: event.log_id,
                attempt: current.attempts,
                status: WebhookStatus::Failed,
                status_code: e.status_code().map(i32::from),
                error: Some(e.to_string()),
                duration_ms,
                attempted_at: Utc::now(),
            },
        };
        self.ledger.finish_webhook_attempt(&attempt).await?;

        match result {
            Ok(receipt) => {
                info!(
                    tenant_id = %event.tenant_id,
                    event_type = %event.event_type,
                    attempt = current.attempts,
                    status = receipt.status_code,
                    "📬 Webhook delivered"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    tenant_id = %event.tenant_id,
                    event_type = %event.event_type,
                    attempt = current.attempts,
                    error = %e,
                    "Webhook delivery failed"
                );
                Err(JobError::Transient(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl JobHandler for WebhookDispatchWorker {
    fn role(&self) -> WorkerRole {
        WorkerRole::Webhook
    }

    #[instrument(skip(self, envelope), fields(job_id = %envelope.id, attempt = envelope.attempts))]
    async fn handle(&self, envelope: &JobEnvelope) -> Result<(), JobError> {
        match &envelope.payload {
            JobPayload::Webhook(event) => self.dispatch(event).await,
            other => Err(JobError::Permanent(format!(
                "webhook worker cannot handle {} jobs",
                other.kind()
            ))),
        }
    }
}
