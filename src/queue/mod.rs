// Queue abstraction - durable at-least-once delivery between producers and workers
pub mod envelope;
pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AppResult, QueueError};

pub use envelope::{EnqueueOptions, EventType, JobEnvelope, JobPayload, QueueName, WebhookEvent};
pub use memory::InMemoryJobQueue;
pub use postgres::PgJobQueue;

/// What a nack did with the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Back on the queue, deliverable again after `delay`
    Requeued { delay: Duration },
    DeadLettered,
}

/// Per-queue envelope counts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: QueueName,
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Broker port shared by producers and consumers.
///
/// CONTRACT:
/// - `claim` hands one envelope to one consumer and increments its attempt
///   counter; the envelope stays invisible to other consumers until it is
///   acked, nacked, or its claim goes stale
/// - `ack` removes the envelope from the deliverable set for good
/// - `nack(requeue = true)` redelivers until the attempt budget is spent and
///   dead-letters on the nack that observes `attempts == max_attempts`;
///   `nack(requeue = false)` dead-letters directly
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> AppResult<Uuid>;

    async fn claim(&self, queue: QueueName, consumer: &str) -> AppResult<Option<JobEnvelope>>;

    async fn ack(&self, envelope: &JobEnvelope) -> AppResult<()>;

    async fn nack(
        &self,
        envelope: &JobEnvelope,
        requeue: bool,
        error: &str,
    ) -> AppResult<NackOutcome>;

    async fn stats(&self, queue: QueueName) -> AppResult<QueueStats>;

    async fn dead_letters(&self, queue: QueueName, limit: i64) -> AppResult<Vec<JobEnvelope>>;

    /// Operator action: put a dead-lettered envelope back with a fresh budget
    async fn requeue_dead_letter(&self, id: Uuid) -> AppResult<JobEnvelope>;
}

/// Reject payloads enqueued on a queue whose worker cannot handle them
pub(crate) fn check_route(queue: QueueName, payload: &JobPayload) -> Result<(), QueueError> {
    if payload.queue() != queue {
        return Err(QueueError::PayloadMismatch {
            queue: queue.to_string(),
            payload: payload.kind().to_string(),
        });
    }
    Ok(())
}
