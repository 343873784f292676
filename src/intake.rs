use std::sync::Arc;

use tracing::info;

use crate::error::AppResult;
use crate::ledger::models::{NewPayment, NewRefund, Payment, Refund};
use crate::ledger::LedgerStore;
use crate::queue::{EnqueueOptions, JobPayload, JobQueue, QueueName};

/// Producer side used by the API layer: persist the entity in `pending`, then
/// queue it for settlement. Request validation is the caller's job.
#[derive(Clone)]
pub struct Intake {
    ledger: Arc<dyn LedgerStore>,
    queue: Arc<dyn JobQueue>,
}

impl Intake {
    pub fn new(ledger: Arc<dyn LedgerStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { ledger, queue }
    }

    pub async fn submit_payment(&self, payment: NewPayment) -> AppResult<Payment> {
        let payment = self.ledger.insert_payment(payment).await?;
        let job_id = self
            .queue
            .enqueue(
                QueueName::PaymentProcessing,
                JobPayload::Payment {
                    payment_id: payment.id.clone(),
                },
                EnqueueOptions::default(),
            )
            .await?;

        info!(payment_id = %payment.id, %job_id, "Payment queued for settlement");
        Ok(payment)
    }

    pub async fn submit_refund(&self, refund: NewRefund) -> AppResult<Refund> {
        let refund = self.ledger.insert_refund(refund).await?;
        let job_id = self
            .queue
            .enqueue(
                QueueName::RefundProcessing,
                JobPayload::Refund {
                    refund_id: refund.id.clone(),
                },
                EnqueueOptions::default(),
            )
            .await?;

        info!(refund_id = %refund.id, %job_id, "Refund queued for settlement");
        Ok(refund)
    }
}
