use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::notify;
use super::strategy::{settle_with_timeout, SettlementOutcome, SettlementStrategy};
use crate::ledger::models::{Payment, PaymentStatus};
use crate::ledger::LedgerStore;
use crate::queue::{EventType, JobEnvelope, JobPayload, JobQueue};
use crate::worker::{JobError, JobHandler, WorkerRole};

/// Settles payments: `pending -> processing -> {completed, failed}`, then
/// queues the tenant notification
pub struct PaymentSettlementWorker {
    ledger: Arc<dyn LedgerStore>,
    queue: Arc<dyn JobQueue>,
    strategy: Arc<dyn SettlementStrategy>,
    timeout: Duration,
}

impl PaymentSettlementWorker {
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
            timeout,
        }
    }

    /// Move a pending payment into `processing`. Returns `None` when another
    /// delivery already finished it.
    async fn begin(&self, payment: Payment) -> Result<Option<Payment>, JobError> {
        if payment.status == PaymentStatus::Processing {
            return Ok(Some(payment));
        }

        if let Some(claimed) = self
            .ledger
            .transition_payment(&payment.id, &[PaymentStatus::Pending], PaymentStatus::Processing, None)
            .await?
        {
            return Ok(Some(claimed));
        }

        // Lost the compare-and-set; look at what won
        let current = self.ledger.get_payment(&payment.id).await?;
        Ok(current.filter(|p| !p.status.is_terminal()))
    }

    async fn settle(&self, payment_id: &str) -> Result<(), JobError> {
        let Some(payment) = self.ledger.get_payment(payment_id).await? else {
            warn!(payment_id, "Payment not found, nothing to settle");
            return Ok(());
        };

        if let Some(event_type) = settled_event(payment.status) {
            // Outcome persisted, notification possibly never queued
            debug!(payment_id, status = %payment.status, "Payment already settled, re-emitting notification");
            return notify(self.queue.as_ref(), &payment.tenant_id, event_type, &payment.id, &payment).await;
        }

        let Some(payment) = self.begin(payment).await? else {
            debug!(payment_id, "Payment settled by another delivery");
            return Ok(());
        };

        let outcome = settle_with_timeout(self.timeout, self.strategy.settle(&payment))
            .await
            .map_err(|e| JobError::Transient(e.to_string()))?;

        let (status, transaction_ref, event_type) = match &outcome {
            SettlementOutcome::Completed { transaction_ref } => (
                PaymentStatus::Completed,
                Some(transaction_ref.as_str()),
                EventType::PAYMENT_COMPLETED,
            ),
            SettlementOutcome::Failed { reason } => {
                info!(payment_id, %reason, "Payment declined");
                (PaymentStatus::Failed, None, EventType::PAYMENT_FAILED)
            }
        };

        let Some(settled) = self
            .ledger
            .transition_payment(payment_id, &[PaymentStatus::Processing], status, transaction_ref)
            .await?
        else {
            debug!(payment_id, "Payment settled by another delivery");
            return Ok(());
        };

        info!(payment_id, status = %settled.status, "✅ Payment settled");
        notify(self.queue.as_ref(), &settled.tenant_id, event_type, &settled.id, &settled).await
    }
}

/// Notification owed to the tenant once a payment reaches `status`
fn settled_event(status: PaymentStatus) -> Option<&'static str> {
    match status {
        PaymentStatus::Completed => Some(EventType::PAYMENT_COMPLETED),
        PaymentStatus::Failed => Some(EventType::PAYMENT_FAILED),
        PaymentStatus::Pending | PaymentStatus::Processing => None,
    }
}

#[async_trait]
impl JobHandler for PaymentSettlementWorker {
    fn role(&self) -> WorkerRole {
        WorkerRole::Payment
    }

    #[instrument(skip(self, envelope), fields(job_id = %envelope.id, attempt = envelope.attempts))]
    async fn handle(&self, envelope: &JobEnvelope) -> Result<(), JobError> {
        match &envelope.payload {
            JobPayload::Payment { payment_id } => self.settle(payment_id).await,
            other => Err(JobError::Permanent(format!(
                "payment worker cannot handle {} jobs",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, AppResult};
    use crate::ledger::models::NewPayment;
    use crate::ledger::InMemoryLedger;
    use crate::queue::{EnqueueOptions, InMemoryJobQueue, NackOutcome, QueueName, QueueStats, WebhookEvent};
    use crate::retry::{RetryPolicies, RetryPolicy};
    use crate::settlement::strategy::{ScriptedSettlement, ScriptedStep};
    use crate::worker::{Consumer, Disposition, WorkerRegistry};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    /// Queue whose first `failures` notification enqueues hit a broker outage
    struct NotifyOutage {
        inner: Arc<InMemoryJobQueue>,
        failures: AtomicU32,
    }

    #[async_trait]
    impl JobQueue for NotifyOutage {
        async fn enqueue(
            &self,
            queue: QueueName,
            payload: JobPayload,
            options: EnqueueOptions,
        ) -> AppResult<Uuid> {
            if queue == QueueName::WebhookDelivery
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(AppError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.enqueue(queue, payload, options).await
        }

        async fn claim(&self, queue: QueueName, consumer: &str) -> AppResult<Option<JobEnvelope>> {
            self.inner.claim(queue, consumer).await
        }

        async fn ack(&self, envelope: &JobEnvelope) -> AppResult<()> {
            self.inner.ack(envelope).await
        }

        async fn nack(
            &self,
            envelope: &JobEnvelope,
            requeue: bool,
            error: &str,
        ) -> AppResult<NackOutcome> {
            self.inner.nack(envelope, requeue, error).await
        }

        async fn stats(&self, queue: QueueName) -> AppResult<QueueStats> {
            self.inner.stats(queue).await
        }

        async fn dead_letters(&self, queue: QueueName, limit: i64) -> AppResult<Vec<JobEnvelope>> {
            self.inner.dead_letters(queue, limit).await
        }

        async fn requeue_dead_letter(&self, id: Uuid) -> AppResult<JobEnvelope> {
            self.inner.requeue_dead_letter(id).await
        }
    }

    struct Harness {
        ledger: Arc<InMemoryLedger>,
        queue: Arc<InMemoryJobQueue>,
        strategy: Arc<ScriptedSettlement>,
        consumer: Consumer,
    }

    async fn harness(strategy: ScriptedSettlement) -> Harness {
        harness_with_outage(strategy, 0).await
    }

    async fn harness_with_outage(strategy: ScriptedSettlement, notify_failures: u32) -> Harness {
        let ledger = Arc::new(InMemoryLedger::new());
        let queue = Arc::new(InMemoryJobQueue::new(RetryPolicies::uniform(
            RetryPolicy::immediate(3),
        )));
        let broker: Arc<dyn JobQueue> = Arc::new(NotifyOutage {
            inner: queue.clone(),
            failures: AtomicU32::new(notify_failures),
        });
        let strategy = Arc::new(strategy);
        let worker = Arc::new(PaymentSettlementWorker::new(
            ledger.clone(),
            broker.clone(),
            strategy.clone(),
            Duration::from_millis(50),
        ));
        let consumer = Consumer::new(
            broker,
            worker,
            Arc::new(WorkerRegistry::new()),
            "payment-0",
            Duration::from_millis(10),
        );

        ledger
            .insert_payment(NewPayment {
                id: "pay_1".into(),
                tenant_id: "t_1".into(),
                amount: dec!(500),
                currency: "INR".into(),
                method: Some("card".into()),
                metadata: serde_json::json!({"order": "o_1"}),
            })
            .await
            .unwrap();
        queue
            .enqueue(
                QueueName::PaymentProcessing,
                JobPayload::Payment {
                    payment_id: "pay_1".into(),
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
    async fn test_successful_settlement_completes_and_notifies() {
        let h = harness(ScriptedSettlement::default()).await;

        assert_eq!(h.consumer.process_next().await.unwrap(), Some(Disposition::Acked));

        let payment = h.ledger.get_payment("pay_1").await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(payment.transaction_ref.as_deref(), Some("txn_pay_1"));

        let events = h.queue.jobs(QueueName::WebhookDelivery);
        assert_eq!(events.len(), 1);
        match &events[0].0.payload {
            JobPayload::Webhook(event) => {
                assert_eq!(event.event_type, "payment.completed");
                assert_eq!(event.tenant_id, "t_1");
                assert_eq!(event.payload["id"], "pay_1");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_declined_settlement_fails_payment() {
        let h = harness(ScriptedSettlement::new([ScriptedStep::Outcome(
            SettlementOutcome::Failed {
                reason: "insufficient funds".into(),
            },
        )]))
        .await;

        assert_eq!(h.consumer.process_next().await.unwrap(), Some(Disposition::Acked));
        let payment = h.ledger.get_payment("pay_1").await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Failed);

        let events = h.queue.jobs(QueueName::WebhookDelivery);
        assert!(matches!(
            &events[0].0.payload,
            JobPayload::Webhook(event) if event.event_type == "payment.failed"
        ));
    }

    #[tokio::test]
    async fn test_terminal_payment_is_not_settled_again() {
        let h = harness(ScriptedSettlement::default()).await;
        h.ledger
            .transition_payment("pay_1", &[PaymentStatus::Pending], PaymentStatus::Processing, None)
            .await
            .unwrap();
        h.ledger
            .transition_payment("pay_1", &[PaymentStatus::Processing], PaymentStatus::Failed, None)
            .await
            .unwrap();

        assert_eq!(h.consumer.process_next().await.unwrap(), Some(Disposition::Acked));
        assert_eq!(h.strategy.calls(), 0);
        assert_eq!(
            h.ledger.get_payment("pay_1").await.unwrap().unwrap().status,
            PaymentStatus::Failed
        );

        // The notification for the persisted outcome is emitted again
        let events = h.queue.jobs(QueueName::WebhookDelivery);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0].0.payload,
            JobPayload::Webhook(event) if event.event_type == "payment.failed"
        ));
    }

    #[tokio::test]
    async fn test_failed_notify_is_emitted_on_redelivery() {
        let h = harness_with_outage(ScriptedSettlement::default(), 1).await;

        let mut dispositions = Vec::new();
        while let Some(disposition) = h.consumer.process_next().await.unwrap() {
            dispositions.push(disposition);
        }

        assert!(matches!(dispositions[..], [Disposition::Requeued(_), Disposition::Acked]));
        assert_eq!(h.strategy.calls(), 1);
        assert_eq!(
            h.ledger.get_payment("pay_1").await.unwrap().unwrap().status,
            PaymentStatus::Completed
        );

        let events = h.queue.jobs(QueueName::WebhookDelivery);
        assert_eq!(events.len(), 1);
        let JobPayload::Webhook(event) = &events[0].0.payload else {
            panic!("expected a webhook event");
        };
        assert_eq!(event.event_type, "payment.completed");
        assert_eq!(
            event.log_id,
            WebhookEvent::for_entity("t_1", EventType::PAYMENT_COMPLETED, "pay_1", serde_json::Value::Null).log_id
        );
        assert!(h
            .queue
            .dead_letters(QueueName::PaymentProcessing, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_timeouts_exhaust_budget_and_leave_processing() {
        let h = harness(ScriptedSettlement::always(ScriptedStep::Hang)).await;

        let mut last = None;
        while let Some(disposition) = h.consumer.process_next().await.unwrap() {
            last = Some(disposition);
        }

        assert_eq!(last, Some(Disposition::DeadLettered));
        assert_eq!(h.strategy.calls(), 3);
        assert_eq!(
            h.ledger.get_payment("pay_1").await.unwrap().unwrap().status,
            PaymentStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_missing_payment_is_acked() {
        let h = harness(ScriptedSettlement::default()).await;
        let worker = PaymentSettlementWorker::new(
            h.ledger.clone(),
            h.queue.clone(),
            h.strategy.clone(),
            Duration::from_millis(50),
        );

        assert!(worker.settle("pay_missing").await.is_ok());
        assert_eq!(h.strategy.calls(), 0);
    }
}
