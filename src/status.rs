use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppResult;
use crate::ledger::models::{Page, WebhookLog};
use crate::ledger::LedgerStore;
use crate::queue::{JobEnvelope, JobQueue, QueueName, QueueStats};
use crate::worker::{WorkerRegistry, WorkerSnapshot};

pub const DEFAULT_PAGE_LIMIT: i64 = 10;
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Entities left in `processing` longer than the stuck threshold
#[derive(Debug, Clone, Serialize)]
pub struct StuckEntities {
    pub payments: Vec<String>,
    pub refunds: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub queues: Vec<QueueStats>,
    pub workers: Vec<WorkerSnapshot>,
    pub worker_status: &'static str,
    pub stuck: StuckEntities,
}

/// Read side for operators: queue depth, worker liveness, stuck entities,
/// dead letters and the webhook audit trail
#[derive(Clone)]
pub struct StatusService {
    ledger: Arc<dyn LedgerStore>,
    queue: Arc<dyn JobQueue>,
    registry: Arc<WorkerRegistry>,
    stuck_after: Duration,
}

impl StatusService {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        queue: Arc<dyn JobQueue>,
        registry: Arc<WorkerRegistry>,
        stuck_after: Duration,
    ) -> Self {
        Self {
            ledger,
            queue,
            registry,
            stuck_after,
        }
    }

    pub async fn health(&self) -> AppResult<()> {
        self.ledger.ping().await
    }

    pub async fn pipeline_status(&self) -> AppResult<PipelineStatus> {
        let mut queues = Vec::new();
        for queue in QueueName::all() {
            queues.push(self.queue.stats(queue).await?);
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.stuck_after)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let stuck = StuckEntities {
            payments: self.ledger.stuck_payments(cutoff).await?,
            refunds: self.ledger.stuck_refunds(cutoff).await?,
        };

        Ok(PipelineStatus {
            queues,
            workers: self.registry.snapshot(),
            worker_status: if self.registry.any_alive() {
                "running"
            } else {
                "stopped"
            },
            stuck,
        })
    }

    pub async fn webhook_logs(
        &self,
        tenant_id: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> AppResult<Page<WebhookLog>> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
        let offset = offset.unwrap_or(0).max(0);
        self.ledger.list_webhook_logs(tenant_id, limit, offset).await
    }

    pub async fn dead_letters(&self, queue: QueueName, limit: Option<i64>) -> AppResult<Vec<JobEnvelope>> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
        self.queue.dead_letters(queue, limit).await
    }

    pub async fn requeue_dead_letter(&self, id: Uuid) -> AppResult<JobEnvelope> {
        self.queue.requeue_dead_letter(id).await
    }
}
