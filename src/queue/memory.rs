use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{check_route, EnqueueOptions, JobEnvelope, JobPayload, JobQueue, NackOutcome, QueueName, QueueStats};
use crate::error::{AppResult, QueueError};
use crate::retry::{RetryDecision, RetryPolicies};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Dead,
}

#[derive(Debug, Clone)]
struct Slot {
    envelope: JobEnvelope,
    state: JobState,
    consumer: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
}

impl Slot {
    /// Claimable now: waiting and due, or active under a claim older than
    /// `stale_before`
    fn deliverable(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Waiting => self.envelope.available_at <= now,
            JobState::Active => self.claimed_at.is_some_and(|at| at < stale_before),
            JobState::Completed | JobState::Dead => false,
        }
    }
}

/// In-process queue with the same delivery contract as [`super::PgJobQueue`].
/// Used by tests and single-process local runs.
pub struct InMemoryJobQueue {
    slots: Mutex<Vec<Slot>>,
    policies: RetryPolicies,
    visibility_timeout: Duration,
}

impl InMemoryJobQueue {
    pub fn new(policies: RetryPolicies) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            policies,
            visibility_timeout: Duration::from_secs(300),
        }
    }

    /// How long a claim may go without ack or nack before the envelope is
    /// handed to another consumer
    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// Snapshot of every envelope ever placed on `queue`, in enqueue order
    pub fn jobs(&self, queue: QueueName) -> Vec<(JobEnvelope, JobState)> {
        self.slots
            .lock()
            .iter()
            .filter(|slot| slot.envelope.queue == queue)
            .map(|slot| (slot.envelope.clone(), slot.state))
            .collect()
    }

    fn to_chrono(delay: Duration) -> chrono::Duration {
        chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// The slot `envelope` was claimed from, as long as that claim is still
    /// the current one
    fn held<'a>(slots: &'a mut [Slot], envelope: &JobEnvelope) -> AppResult<&'a mut Slot> {
        let slot = slots
            .iter_mut()
            .find(|slot| {
                slot.envelope.id == envelope.id
                    && slot.state == JobState::Active
                    && slot.envelope.attempts == envelope.attempts
            })
            .ok_or(QueueError::EnvelopeNotFound(envelope.id))?;
        Ok(slot)
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> AppResult<Uuid> {
        check_route(queue, &payload)?;

        let now = Utc::now();
        let envelope = JobEnvelope {
            id: Uuid::new_v4(),
            queue,
            payload,
            attempts: 0,
            max_attempts: options
                .max_attempts
                .unwrap_or(self.policies.for_queue(queue).max_attempts),
            enqueued_at: now,
            available_at: now + Self::to_chrono(options.delay.unwrap_or_default()),
            last_error: None,
        };
        let id = envelope.id;

        self.slots.lock().push(Slot {
            envelope,
            state: JobState::Waiting,
            consumer: None,
            claimed_at: None,
        });
        debug!(%queue, job_id = %id, "Enqueued job");
        Ok(id)
    }

    async fn claim(&self, queue: QueueName, consumer: &str) -> AppResult<Option<JobEnvelope>> {
        let now = Utc::now();
        let stale_before = now - Self::to_chrono(self.visibility_timeout);
        let mut slots = self.slots.lock();

        // Earliest deliverable first; ties keep enqueue order
        let next = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.envelope.queue == queue && slot.deliverable(now, stale_before))
            .min_by_key(|(index, slot)| (slot.envelope.available_at, *index))
            .map(|(index, _)| index);

        Ok(next.map(|index| {
            let slot = &mut slots[index];
            slot.state = JobState::Active;
            slot.consumer = Some(consumer.to_string());
            slot.claimed_at = Some(now);
            slot.envelope.attempts += 1;
            slot.envelope.clone()
        }))
    }

    async fn ack(&self, envelope: &JobEnvelope) -> AppResult<()> {
        let mut slots = self.slots.lock();
        let slot = Self::held(&mut slots, envelope)?;

        slot.state = JobState::Completed;
        slot.consumer = None;
        slot.claimed_at = None;
        Ok(())
    }

    async fn nack(
        &self,
        envelope: &JobEnvelope,
        requeue: bool,
        error: &str,
    ) -> AppResult<NackOutcome> {
        let decision = if requeue {
            self.policies
                .for_queue(envelope.queue)
                .with_max_attempts(envelope.max_attempts)
                .decide(envelope.attempts)
        } else {
            RetryDecision::DeadLetter
        };

        let mut slots = self.slots.lock();
        let slot = Self::held(&mut slots, envelope).inspect_err(|_| {
            warn!(
                queue = %envelope.queue,
                job_id = %envelope.id,
                attempts = envelope.attempts,
                "Nack ignored, claim is no longer held"
            )
        })?;

        slot.envelope.last_error = Some(error.to_string());
        slot.consumer = None;
        slot.claimed_at = None;

        match decision {
            RetryDecision::Retry { delay } => {
                slot.state = JobState::Waiting;
                slot.envelope.available_at = Utc::now() + Self::to_chrono(delay);
                Ok(NackOutcome::Requeued { delay })
            }
            RetryDecision::DeadLetter => {
                slot.state = JobState::Dead;
                error!(
                    queue = %envelope.queue,
                    job_id = %envelope.id,
                    attempts = envelope.attempts,
                    error,
                    "Job dead-lettered"
                );
                Ok(NackOutcome::DeadLettered)
            }
        }
    }

    async fn stats(&self, queue: QueueName) -> AppResult<QueueStats> {
        let slots = self.slots.lock();
        let count = |state: JobState| {
            slots
                .iter()
                .filter(|slot| slot.envelope.queue == queue && slot.state == state)
                .count() as i64
        };

        Ok(QueueStats {
            queue,
            waiting: count(JobState::Waiting),
            active: count(JobState::Active),
            completed: count(JobState::Completed),
            failed: count(JobState::Dead),
        })
    }

    async fn dead_letters(&self, queue: QueueName, limit: i64) -> AppResult<Vec<JobEnvelope>> {
        Ok(self
            .slots
            .lock()
            .iter()
            .filter(|slot| slot.envelope.queue == queue && slot.state == JobState::Dead)
            .take(limit.max(0) as usize)
            .map(|slot| slot.envelope.clone())
            .collect())
    }

    async fn requeue_dead_letter(&self, id: Uuid) -> AppResult<JobEnvelope> {
        let mut slots = self.slots.lock();
        let slot = slots
            .iter_mut()
            .find(|slot| slot.envelope.id == id && slot.state == JobState::Dead)
            .ok_or(QueueError::EnvelopeNotFound(id))?;

        slot.state = JobState::Waiting;
        slot.envelope.attempts = 0;
        slot.envelope.available_at = Utc::now();
        Ok(slot.envelope.clone())
    }
}
