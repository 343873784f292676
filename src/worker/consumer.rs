use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::{WorkerRegistry, WorkerState};
use super::{JobError, JobHandler};
use crate::error::AppResult;
use crate::queue::{JobEnvelope, JobQueue, NackOutcome};

/// How a claimed envelope was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Requeued(Duration),
    DeadLettered,
}

/// One consumer loop: claims a single envelope, resolves it, then claims the
/// next (prefetch = 1)
pub struct Consumer {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    registry: Arc<WorkerRegistry>,
    instance: String,
    poll_interval: Duration,
}

impl Consumer {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        registry: Arc<WorkerRegistry>,
        instance: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        let instance = instance.into();
        registry.register(handler.role(), &instance);

        Self {
            queue,
            handler,
            registry,
            instance,
            poll_interval,
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Claim and resolve at most one envelope. `None` means the queue had
    /// nothing deliverable.
    pub async fn process_next(&self) -> AppResult<Option<Disposition>> {
        let queue_name = self.handler.role().queue();
        let Some(envelope) = self.queue.claim(queue_name, &self.instance).await? else {
            return Ok(None);
        };

        self.registry.heartbeat(&self.instance, WorkerState::Busy);
        let disposition = self.resolve(&envelope).await;
        self.registry.heartbeat(&self.instance, WorkerState::Idle);

        let disposition = disposition?;
        self.registry
            .record(&self.instance, disposition == Disposition::Acked);
        Ok(Some(disposition))
    }

    async fn resolve(&self, envelope: &JobEnvelope) -> AppResult<Disposition> {
        if envelope.is_exhausted() {
            // Reclaimed after its final attempt died mid-flight
            self.queue
                .nack(envelope, false, "attempt budget exhausted")
                .await?;
            return Ok(Disposition::DeadLettered);
        }

        debug!(
            instance = %self.instance,
            job_id = %envelope.id,
            attempt = envelope.attempts,
            "Handling job"
        );

        match self.handler.handle(envelope).await {
            Ok(()) => {
                self.queue.ack(envelope).await?;
                Ok(Disposition::Acked)
            }
            Err(JobError::Transient(reason)) => {
                warn!(
                    instance = %self.instance,
                    job_id = %envelope.id,
                    attempt = envelope.attempts,
                    max_attempts = envelope.max_attempts,
                    %reason,
                    "Job failed, nacking"
                );
                let outcome = self.queue.nack(envelope, true, &reason).await?;
                Ok(match outcome {
                    NackOutcome::Requeued { delay } => Disposition::Requeued(delay),
                    NackOutcome::DeadLettered => Disposition::DeadLettered,
                })
            }
            Err(JobError::Permanent(reason)) => {
                self.queue.nack(envelope, false, &reason).await?;
                Ok(Disposition::DeadLettered)
            }
        }
    }

    /// Run until cancelled. The envelope in hand is always resolved before
    /// the loop exits.
    pub async fn run(self, cancel: CancellationToken) {
        info!(instance = %self.instance, queue = %self.handler.role().queue(), "🔄 Consumer started");

        while !cancel.is_cancelled() {
            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    self.registry.heartbeat(&self.instance, WorkerState::Idle);
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!(instance = %self.instance, error = %e, "Consumer iteration failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }

        self.registry.heartbeat(&self.instance, WorkerState::Stopped);
        info!(instance = %self.instance, "Consumer stopped");
    }
}

/// Register `handler` on its queue and spawn the consume loop
pub fn consume(
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    registry: Arc<WorkerRegistry>,
    instance: impl Into<String>,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let consumer = Consumer::new(queue, handler, registry, instance, poll_interval);
    tokio::spawn(consumer.run(cancel))
}
