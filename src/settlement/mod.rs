// Settlement workers - payment and refund state machines
pub mod payment_worker;
pub mod refund_worker;
pub mod strategy;

use serde::Serialize;
use tracing::debug;

use crate::error::AppError;
use crate::queue::{EnqueueOptions, JobPayload, JobQueue, QueueName, WebhookEvent};
use crate::worker::JobError;

pub use payment_worker::PaymentSettlementWorker;
pub use refund_worker::{AmountCeilingPolicy, RefundPolicy, RefundSettlementWorker};
pub use strategy::{SettlementOutcome, SettlementStrategy, SimulatedSettlement};
#[doc(hidden)]
pub use strategy::{ScriptedSettlement, ScriptedStep};

/// Queue the tenant notification for a settled entity. The payload is a
/// snapshot of the entity as persisted.
pub(crate) async fn notify<T: Serialize>(
    queue: &dyn JobQueue,
    tenant_id: &str,
    event_type: &str,
    entity_id: &str,
    entity: &T,
) -> Result<(), JobError> {
    let payload = serde_json::to_value(entity).map_err(AppError::from)?;
    let event = WebhookEvent::for_entity(tenant_id, event_type, entity_id, payload);
    let log_id = event.log_id;

    queue
        .enqueue(
            QueueName::WebhookDelivery,
            JobPayload::Webhook(event),
            EnqueueOptions::default(),
        )
        .await?;

    debug!(tenant_id, event_type, entity_id, %log_id, "Notification queued");
    Ok(())
}
