use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use super::models::{HealthResponse, LimitQuery, PageQuery};
use crate::error::AppResult;
use crate::ledger::models::{Page, WebhookLog};
use crate::queue::{JobEnvelope, QueueName};
use crate::status::{PipelineStatus, StatusService};

/// Shared state of the operational router
#[derive(Clone)]
pub struct AppState {
    pub status: StatusService,
}

/// GET /health - store reachability
pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    state.status.health().await?;

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
    }))
}

/// GET /api/v1/jobs/status - queue counts, worker liveness, stuck entities
pub async fn get_jobs_status(State(state): State<AppState>) -> AppResult<Json<PipelineStatus>> {
    Ok(Json(state.status.pipeline_status().await?))
}

/// GET /api/v1/tenants/:tenant_id/webhooks - paginated webhook audit trail
pub async fn list_webhook_logs(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<Page<WebhookLog>>> {
    let page = state
        .status
        .webhook_logs(&tenant_id, query.limit, query.offset)
        .await?;
    Ok(Json(page))
}

/// GET /api/v1/queues/:queue/dead-letters
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Json<Vec<JobEnvelope>>> {
    let queue: QueueName = queue.parse()?;
    Ok(Json(state.status.dead_letters(queue, query.limit).await?))
}

/// POST /api/v1/queues/dead-letters/:job_id/retry - operator requeue
pub async fn retry_dead_letter(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<JobEnvelope>> {
    let envelope = state.status.requeue_dead_letter(job_id).await?;
    info!(%job_id, queue = %envelope.queue, "♻️ Dead letter requeued by operator");
    Ok(Json(envelope))
}
