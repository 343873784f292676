use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, info, instrument, warn};

use super::notify;
use super::strategy::{settle_with_timeout, SettlementOutcome, SettlementStrategy};
use crate::ledger::models::{Payment, PaymentStatus, Refund, RefundStatus};
use crate::ledger::LedgerStore;
use crate::queue::{EventType, JobEnvelope, JobPayload, JobQueue};
use crate::worker::{JobError, JobHandler, WorkerRole};

/// Business-rule check run before a refund is settled. A rejection is
/// permanent: the refund fails with the returned reason and is never retried.
pub trait RefundPolicy: Send + Sync {
    fn check(&self, refund: &Refund, payment: &Payment) -> Result<(), String>;
}

/// Refund amount must be positive and within the original payment amount
#[derive(Debug, Clone, Copy, Default)]
pub struct AmountCeilingPolicy;

impl RefundPolicy for AmountCeilingPolicy {
    fn check(&self, refund: &Refund, payment: &Payment) -> Result<(), String> {
        if refund.amount <= Decimal::ZERO {
            return Err(format!("refund amount {} must be positive", refund.amount));
        }
        if refund.amount > payment.amount {
            return Err(format!(
                "refund amount {} exceeds payment amount {}",
                refund.amount, payment.amount
            ));
        }
        Ok(())
    }
}

/// Settles refunds. Same state machine as payments, gated on the original
/// payment being `completed`.
pub struct RefundSettlementWorker {
    ledger: Arc<dyn LedgerStore>,
    queue: Arc<dyn JobQueue>,
    strategy: Arc<dyn SettlementStrategy>,
    policy: Arc<dyn RefundPolicy>,
    timeout: Duration,
}

impl RefundSettlementWorker {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        queue: Arc<dyn JobQueue>,
        strategy: Arc<dyn SettlementStrategy>,
        timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            queue,
            strategy,
            policy: Arc::new(AmountCeilingPolicy),
            timeout,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn RefundPolicy>) -> Self {
        self.policy = policy;
        self
    }

    fn rejection(&self, refund: &Refund, payment: Option<&Payment>) -> Option<String> {
        match payment {
            None => Some(format!("payment {} not found", refund.payment_id)),
            Some(payment) if payment.status != PaymentStatus::Completed => Some(format!(
                "payment {} is {}, only completed payments can be refunded",
                payment.id, payment.status
            )),
            Some(payment) => self.policy.check(refund, payment).err(),
        }
    }

    /// Fail a refund that can never succeed and tell the tenant
    async fn reject(&self, refund: &Refund, from: RefundStatus, reason: &str) -> Result<(), JobError> {
        warn!(refund_id = %refund.id, %reason, "Refund rejected");

        let Some(failed) = self
            .ledger
            .transition_refund(&refund.id, &[from], RefundStatus::Failed, Some(reason))
            .await?
        else {
            debug!(refund_id = %refund.id, "Refund resolved by another delivery");
            return Ok(());
        };

        notify(
            self.queue.as_ref(),
            &failed.tenant_id,
            EventType::REFUND_FAILED,
            &failed.id,
            &failed,
        )
        .await
    }

    async fn begin(&self, refund: Refund) -> Result<Option<Refund>, JobError> {
        if refund.status == RefundStatus::Processing {
            return Ok(Some(refund));
        }

        if let Some(claimed) = self
            .ledger
            .transition_refund(&refund.id, &[RefundStatus::Pending], RefundStatus::Processing, None)
            .await?
        {
            return Ok(Some(claimed));
        }

        let current = self.ledger.get_refund(&refund.id).await?;
        Ok(current.filter(|r| !r.status.is_terminal()))
    }

    async fn settle(&self, refund_id: &str) -> Result<(), JobError> {
        let Some(refund) = self.ledger.get_refund(refund_id).await? else {
            warn!(refund_id, "Refund not found, nothing to settle");
            return Ok(());
        };

        if let Some(event_type) = settled_event(refund.status) {
            debug!(refund_id, status = %refund.status, "Refund already settled, re-emitting notification");
            return notify(self.queue.as_ref(), &refund.tenant_id, event_type, &refund.id, &refund).await;
        }

        let payment = self.ledger.get_payment(&refund.payment_id).await?;
        if let Some(reason) = self.rejection(&refund, payment.as_ref()) {
            return self.reject(&refund, refund.status, &reason).await;
        }
        let Some(payment) = payment else {
            return Ok(());
        };

        let Some(refund) = self.begin(refund).await? else {
            debug!(refund_id, "Refund settled by another delivery");
            return Ok(());
        };

        let outcome = settle_with_timeout(self.timeout, self.strategy.settle_refund(&refund, &payment))
            .await
            .map_err(|e| JobError::Transient(e.to_string()))?;

        let (status, reason, event_type) = match &outcome {
            SettlementOutcome::Completed { transaction_ref } => {
                debug!(refund_id, %transaction_ref, "Refund approved");
                (RefundStatus::Completed, None, EventType::REFUND_COMPLETED)
            }
            SettlementOutcome::Failed { reason } => (
                RefundStatus::Failed,
                Some(reason.as_str()),
                EventType::REFUND_FAILED,
            ),
        };

        let Some(settled) = self
            .ledger
            .transition_refund(refund_id, &[RefundStatus::Processing], status, reason)
            .await?
        else {
            debug!(refund_id, "Refund settled by another delivery");
            return Ok(());
        };

        info!(refund_id, status = %settled.status, "✅ Refund settled");
        notify(self.queue.as_ref(), &settled.tenant_id, event_type, &settled.id, &settled).await
    }
}

fn settled_event(status: RefundStatus) -> Option<&'static str> {
    match status {
        RefundStatus::Completed => Some(EventType::REFUND_COMPLETED),
        RefundStatus::Failed => Some(EventType::REFUND_FAILED),
        RefundStatus::Pending | RefundStatus::Processing => None,
    }
}

#[async_trait]
impl JobHandler for RefundSettlementWorker {
    fn role(&self) -> WorkerRole {
        WorkerRole::Refund
    }

    #[instrument(skip(self, envelope), fields(job_id = %envelope.id, attempt = envelope.attempts))]
    async fn handle(&self, envelope: &JobEnvelope) -> Result<(), JobError> {
        match &envelope.payload {
            JobPayload::Refund { refund_id } => self.settle(refund_id).await,
            other => Err(JobError::Permanent(format!(
                "refund worker cannot handle {} jobs",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::{NewPayment, NewRefund};
    use crate::ledger::InMemoryLedger;
    use crate::queue::{EnqueueOptions, InMemoryJobQueue, QueueName};
    use crate::retry::{RetryPolicies, RetryPolicy};
    use crate::settlement::strategy::ScriptedSettlement;
    use crate::worker::{Consumer, Disposition, WorkerRegistry};
    use rust_decimal_macros::dec;

    struct Harness {
        ledger: Arc<InMemoryLedger>,
        queue: Arc<InMemoryJobQueue>,
        strategy: Arc<ScriptedSettlement>,
        consumer: Consumer,
    }

    async fn harness(payment_status: PaymentStatus, refund_amount: Decimal) -> Harness {
        let ledger = Arc::new(InMemoryLedger::new());
        let queue = Arc::new(InMemoryJobQueue::new(RetryPolicies::uniform(
            RetryPolicy::immediate(3),
        )));
        let strategy = Arc::new(ScriptedSettlement::default());
        let worker = Arc::new(RefundSettlementWorker::new(
            ledger.clone(),
            queue.clone(),
            strategy.clone(),
            Duration::from_millis(50),
        ));
        let consumer = Consumer::new(
            queue.clone(),
            worker,
            Arc::new(WorkerRegistry::new()),
            "refund-0",
            Duration::from_millis(10),
        );

        ledger
            .insert_payment(NewPayment {
                id: "pay_1".into(),
                tenant_id: "t_1".into(),
                amount: dec!(500),
                currency: "INR".into(),
                method: None,
                metadata: serde_json::Value::Null,
            })
            .await
            .unwrap();
        if payment_status != PaymentStatus::Pending {
            ledger
                .transition_payment("pay_1", &[PaymentStatus::Pending], PaymentStatus::Processing, None)
                .await
                .unwrap();
            ledger
                .transition_payment("pay_1", &[PaymentStatus::Processing], payment_status, None)
                .await
                .unwrap();
        }

        ledger
            .insert_refund(NewRefund {
                id: "rfnd_1".into(),
                payment_id: "pay_1".into(),
                tenant_id: "t_1".into(),
                amount: refund_amount,
                reason: None,
            })
            .await
            .unwrap();
        queue
            .enqueue(
                QueueName::RefundProcessing,
                JobPayload::Refund {
                    refund_id: "rfnd_1".into(),
                },
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        Harness {
            ledger,
            queue,
            strategy,
            consumer,
        }
    }

    #[tokio::test]
    async fn test_refund_of_completed_payment_settles() {
        let h = harness(PaymentStatus::Completed, dec!(200)).await;

        assert_eq!(h.consumer.process_next().await.unwrap(), Some(Disposition::Acked));
        let refund = h.ledger.get_refund("rfnd_1").await.unwrap().unwrap();
        assert_eq!(refund.status, RefundStatus::Completed);

        let events = h.queue.jobs(QueueName::WebhookDelivery);
        assert!(matches!(
            &events[0].0.payload,
            JobPayload::Webhook(event) if event.event_type == "refund.completed"
        ));
    }

    #[tokio::test]
    async fn test_refund_of_pending_payment_fails_without_retry() {
        let h = harness(PaymentStatus::Pending, dec!(200)).await;

        assert_eq!(h.consumer.process_next().await.unwrap(), Some(Disposition::Acked));
        assert_eq!(h.consumer.process_next().await.unwrap(), None);

        let refund = h.ledger.get_refund("rfnd_1").await.unwrap().unwrap();
        assert_eq!(refund.status, RefundStatus::Failed);
        assert!(refund
            .failure_reason
            .unwrap()
            .contains("only completed payments"));
        assert_eq!(h.strategy.calls(), 0);

        let stats = h.queue.stats(QueueName::RefundProcessing).await.unwrap();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_refund_above_payment_amount_is_rejected() {
        let h = harness(PaymentStatus::Completed, dec!(600)).await;

        assert_eq!(h.consumer.process_next().await.unwrap(), Some(Disposition::Acked));
        let refund = h.ledger.get_refund("rfnd_1").await.unwrap().unwrap();
        assert_eq!(refund.status, RefundStatus::Failed);
        assert!(refund
            .failure_reason
            .unwrap()
            .contains("exceeds payment amount"));
    }

    #[tokio::test]
    async fn test_settled_refund_reemits_its_notification() {
        let h = harness(PaymentStatus::Completed, dec!(200)).await;
        h.ledger
            .transition_refund("rfnd_1", &[RefundStatus::Pending], RefundStatus::Failed, Some("declined"))
            .await
            .unwrap();

        assert_eq!(h.consumer.process_next().await.unwrap(), Some(Disposition::Acked));
        assert_eq!(h.strategy.calls(), 0);

        let events = h.queue.jobs(QueueName::WebhookDelivery);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0].0.payload,
            JobPayload::Webhook(event) if event.event_type == "refund.failed" && event.payload["id"] == "rfnd_1"
        ));
    }

    #[test]
    fn test_amount_ceiling_policy() {
        let now = chrono::Utc::now();
        let payment = Payment {
            id: "pay_1".into(),
            tenant_id: "t_1".into(),
            amount: dec!(500),
            currency: "INR".into(),
            status: PaymentStatus::Completed,
            method: None,
            transaction_ref: None,
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        };
        let mut refund = Refund {
            id: "rfnd_1".into(),
            payment_id: "pay_1".into(),
            tenant_id: "t_1".into(),
            amount: dec!(500),
            status: RefundStatus::Pending,
            reason: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };

        assert!(AmountCeilingPolicy.check(&refund, &payment).is_ok());
        refund.amount = dec!(0);
        assert!(AmountCeilingPolicy.check(&refund, &payment).is_err());
    }
}
