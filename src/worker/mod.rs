// Consumer runtime - handler contract, consume loop, liveness, supervision
pub mod consumer;
pub mod registry;
pub mod supervisor;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::error::AppError;
use crate::queue::{JobEnvelope, QueueName};

pub use consumer::{consume, Consumer, Disposition};
pub use registry::{WorkerRegistry, WorkerSnapshot, WorkerState};
pub use supervisor::WorkerSupervisor;

/// Worker roles, one per queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    Payment,
    Refund,
    Webhook,
}

impl WorkerRole {
    pub fn queue(&self) -> QueueName {
        match self {
            WorkerRole::Payment => QueueName::PaymentProcessing,
            WorkerRole::Refund => QueueName::RefundProcessing,
            WorkerRole::Webhook => QueueName::WebhookDelivery,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Payment => "payment",
            WorkerRole::Refund => "refund",
            WorkerRole::Webhook => "webhook",
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a handler gave up on an envelope
#[derive(Error, Debug)]
pub enum JobError {
    /// Infrastructure trouble; the envelope is requeued under the retry policy
    #[error("transient failure: {0}")]
    Transient(String),

    /// Can never succeed; the envelope is dead-lettered without further attempts
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl JobError {
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Transient(_))
    }
}

impl From<AppError> for JobError {
    fn from(error: AppError) -> Self {
        JobError::Transient(error.to_string())
    }
}

/// Processes envelopes of one queue.
///
/// Handlers run under at-least-once delivery and must be idempotent with
/// respect to their own outcome. `Ok` acks the envelope.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn role(&self) -> WorkerRole;

    async fn handle(&self, envelope: &JobEnvelope) -> Result<(), JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_errors_are_transient() {
        let error: JobError = AppError::Database(sqlx::Error::PoolTimedOut).into();
        assert!(error.is_transient());
        assert!(!JobError::Permanent("bad".into()).is_transient());
    }

    #[test]
    fn test_roles_map_to_queues() {
        assert_eq!(WorkerRole::Payment.queue(), QueueName::PaymentProcessing);
        assert_eq!(WorkerRole::Refund.queue(), QueueName::RefundProcessing);
        assert_eq!(WorkerRole::Webhook.queue(), QueueName::WebhookDelivery);
    }
}
