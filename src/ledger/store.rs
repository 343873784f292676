use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::*;
use crate::error::AppResult;

/// Persistent store port - the single shared mutable resource of the pipeline.
///
/// INVARIANTS:
/// - Every entity mutation is a single-row update keyed by primary id
/// - `transition_*` are compare-and-set: the row is only updated when its
///   current status is one of `from`, otherwise `None` is returned
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn ping(&self) -> AppResult<()>;

    async fn get_tenant(&self, tenant_id: &str) -> AppResult<Option<Tenant>>;

    async fn insert_payment(&self, payment: NewPayment) -> AppResult<Payment>;

    async fn get_payment(&self, payment_id: &str) -> AppResult<Option<Payment>>;

    async fn transition_payment(
        &self,
        payment_id: &str,
        from: &[PaymentStatus],
        to: PaymentStatus,
        transaction_ref: Option<&str>,
    ) -> AppResult<Option<Payment>>;

    async fn insert_refund(&self, refund: NewRefund) -> AppResult<Refund>;

    async fn get_refund(&self, refund_id: &str) -> AppResult<Option<Refund>>;

    async fn transition_refund(
        &self,
        refund_id: &str,
        from: &[RefundStatus],
        to: RefundStatus,
        failure_reason: Option<&str>,
    ) -> AppResult<Option<Refund>>;

    /// Create the log row on first delivery, or bump its attempt counter on
    /// redelivery. The row is left in `pending`.
    async fn begin_webhook_attempt(&self, log: &NewWebhookLog) -> AppResult<WebhookLog>;

    /// Record that the event was acknowledged without any delivery attempt.
    /// A row that was already delivered keeps its status and note.
    async fn record_webhook_skipped(&self, log: &NewWebhookLog, note: &str)
        -> AppResult<WebhookLog>;

    /// Store the attempt outcome as the log's current status and append it to
    /// the attempt history
    async fn finish_webhook_attempt(&self, attempt: &WebhookAttempt) -> AppResult<()>;

    async fn get_webhook_log(&self, log_id: Uuid) -> AppResult<Option<WebhookLog>>;

    async fn list_webhook_logs(
        &self,
        tenant_id: &str,
        limit: i64,
        offset: i64,
    ) -> AppResult<Page<WebhookLog>>;

    async fn list_webhook_attempts(&self, log_id: Uuid) -> AppResult<Vec<WebhookAttempt>>;

    /// Payments left in `processing` since before `older_than`
    async fn stuck_payments(&self, older_than: DateTime<Utc>) -> AppResult<Vec<String>>;

    /// Refunds left in `processing` since before `older_than`
    async fn stuck_refunds(&self, older_than: DateTime<Utc>) -> AppResult<Vec<String>>;
}
