use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{check_route, EnqueueOptions, JobEnvelope, JobPayload, JobQueue, NackOutcome, QueueName, QueueStats};
use crate::error::{AppError, AppResult, QueueError};
use crate::retry::{RetryDecision, RetryPolicies};

const JOB_COLUMNS: &str = "id, queue, payload, attempts, max_attempts, enqueued_at, available_at, last_error";

/// PostgreSQL-backed queue. The `jobs` table is the broker: envelopes are
/// claimed with `FOR UPDATE SKIP LOCKED`, so any number of worker processes
/// can compete for the same queue without claiming the same row twice.
///
/// Dead letters stay in the table with status `dead`.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    policies: RetryPolicies,
    visibility_timeout: Duration,
}

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    queue: String,
    payload: serde_json::Value,
    attempts: i32,
    max_attempts: i32,
    enqueued_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl JobRow {
    fn into_envelope(self) -> AppResult<JobEnvelope> {
        let queue: QueueName = self.queue.parse()?;
        let payload: JobPayload =
            serde_json::from_value(self.payload).map_err(|e| QueueError::MalformedPayload {
                id: self.id,
                message: e.to_string(),
            })?;

        Ok(JobEnvelope {
            id: self.id,
            queue,
            payload,
            attempts: self.attempts.max(0) as u32,
            max_attempts: self.max_attempts.max(0) as u32,
            enqueued_at: self.enqueued_at,
            available_at: self.available_at,
            last_error: self.last_error,
        })
    }
}

impl PgJobQueue {
    pub fn new(pool: PgPool, policies: RetryPolicies, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            policies,
            visibility_timeout,
        }
    }

    fn after(delay: Duration) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
    }

    async fn bury(&self, id: Uuid, reason: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'dead', last_error = $2, claimed_at = NULL, claimed_by = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> AppResult<Uuid> {
        check_route(queue, &payload)?;

        let id = Uuid::new_v4();
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.policies.for_queue(queue).max_attempts);

        sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, payload, status, attempts, max_attempts, enqueued_at, available_at)
            VALUES ($1, $2, $3, 'waiting', 0, $4, NOW(), $5)
            "#,
        )
        .bind(id)
        .bind(queue.as_str())
        .bind(serde_json::to_value(&payload)?)
        .bind(max_attempts as i32)
        .bind(Self::after(options.delay.unwrap_or_default()))
        .execute(&self.pool)
        .await?;

        debug!(%queue, job_id = %id, "Enqueued job");
        Ok(id)
    }

    async fn claim(&self, queue: QueueName, consumer: &str) -> AppResult<Option<JobEnvelope>> {
        // Active rows whose claim predates the cutoff belong to a consumer
        // that died mid-job and are delivered again
        let stale_before = Utc::now()
            - chrono::Duration::from_std(self.visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero());

        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'active',
                attempts = attempts + 1,
                claimed_at = NOW(),
                claimed_by = $2
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = $1
                  AND ((status = 'waiting' AND available_at <= NOW())
                    OR (status = 'active' AND claimed_at < $3))
                ORDER BY available_at ASC, enqueued_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let Some(row) = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue.as_str())
            .bind(consumer)
            .bind(stale_before)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let id = row.id;
        match row.into_envelope() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(e) => {
                // Undecodable rows can never succeed
                error!(%queue, job_id = %id, error = %e, "Dead-lettering malformed job");
                self.bury(id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn ack(&self, envelope: &JobEnvelope) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', completed_at = NOW(), claimed_at = NULL, claimed_by = NULL
            WHERE id = $1 AND status = 'active' AND attempts = $2
            "#,
        )
        .bind(envelope.id)
        .bind(envelope.attempts as i32)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                queue = %envelope.queue,
                job_id = %envelope.id,
                attempts = envelope.attempts,
                "Ack ignored, claim is no longer held"
            );
            return Err(QueueError::EnvelopeNotFound(envelope.id).into());
        }
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

        let (status, available_at, outcome) = match decision {
            RetryDecision::Retry { delay } => {
                ("waiting", Self::after(delay), NackOutcome::Requeued { delay })
            }
            RetryDecision::DeadLetter => ("dead", envelope.available_at, NackOutcome::DeadLettered),
        };

        // Guarded by the attempt number so a consumer whose claim went stale
        // cannot overwrite the state of a newer delivery
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, available_at = $3, last_error = $4,
                claimed_at = NULL, claimed_by = NULL
            WHERE id = $1 AND status = 'active' AND attempts = $5
            "#,
        )
        .bind(envelope.id)
        .bind(status)
        .bind(available_at)
        .bind(error)
        .bind(envelope.attempts as i32)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                queue = %envelope.queue,
                job_id = %envelope.id,
                attempts = envelope.attempts,
                "Nack ignored, claim is no longer held"
            );
            return Err(QueueError::EnvelopeNotFound(envelope.id).into());
        }

        if outcome == NackOutcome::DeadLettered {
            error!(
                queue = %envelope.queue,
                job_id = %envelope.id,
                attempts = envelope.attempts,
                error,
                "Job dead-lettered"
            );
        }

        Ok(outcome)
    }

    async fn stats(&self, queue: QueueName) -> AppResult<QueueStats> {
        let counts: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM jobs
            WHERE queue = $1
            GROUP BY status
            "#,
        )
        .bind(queue.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats {
            queue,
            waiting: 0,
            active: 0,
            completed: 0,
            failed: 0,
        };
        for (status, count) in counts {
            match status.as_str() {
                "waiting" => stats.waiting = count,
                "active" => stats.active = count,
                "completed" => stats.completed = count,
                "dead" => stats.failed = count,
                other => warn!(%queue, status = other, "Unknown job status"),
            }
        }

        Ok(stats)
    }

    async fn dead_letters(&self, queue: QueueName, limit: i64) -> AppResult<Vec<JobEnvelope>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE queue = $1 AND status = 'dead'
            ORDER BY enqueued_at DESC
            LIMIT $2
            "#
        );

        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        // A malformed payload is itself a reason to be here; skip what cannot be shown
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_envelope().ok())
            .collect())
    }

    async fn requeue_dead_letter(&self, id: Uuid) -> AppResult<JobEnvelope> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'waiting', attempts = 0, available_at = NOW()
            WHERE id = $1 AND status = 'dead'
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::Queue(QueueError::EnvelopeNotFound(id)))?;

        row.into_envelope()
    }
}
