use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::*;
use super::store::LedgerStore;
use crate::error::{AppError, AppResult};

/// In-memory ledger store.
///
/// Every operation takes the write lock for the table it touches, so a
/// compare-and-set transition is atomic the same way a single-row UPDATE is.
#[derive(Default)]
pub struct InMemoryLedger {
    tenants: RwLock<HashMap<String, Tenant>>,
    payments: RwLock<HashMap<String, Payment>>,
    refunds: RwLock<HashMap<String, Refund>>,
    webhook_logs: RwLock<HashMap<Uuid, WebhookLog>>,
    webhook_attempts: RwLock<Vec<WebhookAttempt>>,
    unavailable: AtomicBool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_tenant(&self, tenant: Tenant) {
        self.tenants.write().await.insert(tenant.id.clone(), tenant);
    }

    /// While set, every call fails the way an unreachable database does
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn ping(&self) -> AppResult<()> {
        self.check_available()
    }

    async fn get_tenant(&self, tenant_id: &str) -> AppResult<Option<Tenant>> {
        self.check_available()?;
        Ok(self.tenants.read().await.get(tenant_id).cloned())
    }

    async fn insert_payment(&self, payment: NewPayment) -> AppResult<Payment> {
        self.check_available()?;
        let mut payments = self.payments.write().await;
        if payments.contains_key(&payment.id) {
            return Err(AppError::InvalidInput(format!(
                "Payment {} already exists",
                payment.id
            )));
        }

        let now = Utc::now();
        let stored = Payment {
            id: payment.id,
            tenant_id: payment.tenant_id,
            amount: payment.amount,
            currency: payment.currency,
            status: PaymentStatus::Pending,
            method: payment.method,
            transaction_ref: None,
            metadata: payment.metadata,
            created_at: now,
            updated_at: now,
        };
        payments.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_payment(&self, payment_id: &str) -> AppResult<Option<Payment>> {
        self.check_available()?;
        Ok(self.payments.read().await.get(payment_id).cloned())
    }

    async fn transition_payment(
        &self,
        payment_id: &str,
        from: &[PaymentStatus],
        to: PaymentStatus,
        transaction_ref: Option<&str>,
    ) -> AppResult<Option<Payment>> {
        self.check_available()?;
        let mut payments = self.payments.write().await;
        let Some(payment) = payments.get_mut(payment_id) else {
            return Ok(None);
        };
        if !from.contains(&payment.status) {
            return Ok(None);
        }

        payment.status = to;
        if let Some(reference) = transaction_ref {
            payment.transaction_ref = Some(reference.to_string());
        }
        payment.updated_at = Utc::now();
        Ok(Some(payment.clone()))
    }

    async fn insert_refund(&self, refund: NewRefund) -> AppResult<Refund> {
        self.check_available()?;
        let mut refunds = self.refunds.write().await;
        if refunds.contains_key(&refund.id) {
            return Err(AppError::InvalidInput(format!(
                "Refund {} already exists",
                refund.id
            )));
        }

        let now = Utc::now();
        let stored = Refund {
            id: refund.id,
            payment_id: refund.payment_id,
            tenant_id: refund.tenant_id,
            amount: refund.amount,
            status: RefundStatus::Pending,
            reason: refund.reason,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        refunds.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_refund(&self, refund_id: &str) -> AppResult<Option<Refund>> {
        self.check_available()?;
        Ok(self.refunds.read().await.get(refund_id).cloned())
    }

    async fn transition_refund(
        &self,
        refund_id: &str,
        from: &[RefundStatus],
        to: RefundStatus,
        failure_reason: Option<&str>,
    ) -> AppResult<Option<Refund>> {
        self.check_available()?;
        let mut refunds = self.refunds.write().await;
        let Some(refund) = refunds.get_mut(refund_id) else {
            return Ok(None);
        };
        if !from.contains(&refund.status) {
            return Ok(None);
        }

        refund.status = to;
        if let Some(reason) = failure_reason {
            refund.failure_reason = Some(reason.to_string());
        }
        refund.updated_at = Utc::now();
        Ok(Some(refund.clone()))
    }

    async fn begin_webhook_attempt(&self, log: &NewWebhookLog) -> AppResult<WebhookLog> {
        self.check_available()?;
        let now = Utc::now();
        let mut logs = self.webhook_logs.write().await;
        let entry = logs.entry(log.id).or_insert_with(|| WebhookLog {
            id: log.id,
            tenant_id: log.tenant_id.clone(),
            event_type: log.event_type.clone(),
            payload: log.payload.clone(),
            status: WebhookStatus::Pending,
            attempts: 0,
            note: None,
            created_at: now,
            updated_at: now,
        });

        entry.status = WebhookStatus::Pending;
        entry.attempts += 1;
        entry.updated_at = now;
        Ok(entry.clone())
    }

    async fn record_webhook_skipped(
        &self,
        log: &NewWebhookLog,
        note: &str,
    ) -> AppResult<WebhookLog> {
        self.check_available()?;
        let now = Utc::now();
        let mut logs = self.webhook_logs.write().await;
        let entry = logs.entry(log.id).or_insert_with(|| WebhookLog {
            id: log.id,
            tenant_id: log.tenant_id.clone(),
            event_type: log.event_type.clone(),
            payload: log.payload.clone(),
            status: WebhookStatus::Skipped,
            attempts: 0,
            note: None,
            created_at: now,
            updated_at: now,
        });

        // A tenant that already received the event keeps its delivered record
        if entry.status != WebhookStatus::Delivered {
            entry.status = WebhookStatus::Skipped;
            entry.note = Some(note.to_string());
            entry.updated_at = now;
        }
        Ok(entry.clone())
    }

    async fn finish_webhook_attempt(&self, attempt: &WebhookAttempt) -> AppResult<()> {
        self.check_available()?;
        let mut logs = self.webhook_logs.write().await;
        let log = logs
            .get_mut(&attempt.log_id)
            .ok_or_else(|| AppError::NotFound(format!("Webhook log {}", attempt.log_id)))?;

        log.status = attempt.status;
        log.updated_at = Utc::now();
        self.webhook_attempts.write().await.push(attempt.clone());
        Ok(())
    }

    async fn get_webhook_log(&self, log_id: Uuid) -> AppResult<Option<WebhookLog>> {
        self.check_available()?;
        Ok(self.webhook_logs.read().await.get(&log_id).cloned())
    }

    async fn list_webhook_logs(
        &self,
        tenant_id: &str,
        limit: i64,
        offset: i64,
    ) -> AppResult<Page<WebhookLog>> {
        self.check_available()?;
        let logs = self.webhook_logs.read().await;
        let mut rows: Vec<WebhookLog> = logs
            .values()
            .filter(|log| log.tenant_id == tenant_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = rows.len() as i64;
        let data = rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();

        Ok(Page {
            data,
            total,
            limit,
            offset,
        })
    }

    async fn list_webhook_attempts(&self, log_id: Uuid) -> AppResult<Vec<WebhookAttempt>> {
        self.check_available()?;
        Ok(self
            .webhook_attempts
            .read()
            .await
            .iter()
            .filter(|attempt| attempt.log_id == log_id)
            .cloned()
            .collect())
    }

    async fn stuck_payments(&self, older_than: DateTime<Utc>) -> AppResult<Vec<String>> {
        self.check_available()?;
        Ok(self
            .payments
            .read()
            .await
            .values()
            .filter(|p| p.status == PaymentStatus::Processing && p.updated_at < older_than)
            .map(|p| p.id.clone())
            .collect())
    }

    async fn stuck_refunds(&self, older_than: DateTime<Utc>) -> AppResult<Vec<String>> {
        self.check_available()?;
        Ok(self
            .refunds
            .read()
            .await
            .values()
            .filter(|r| r.status == RefundStatus::Processing && r.updated_at < older_than)
            .map(|r| r.id.clone())
            .collect())
    }
}
