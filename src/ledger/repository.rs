use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::models::*;
use super::store::LedgerStore;
use crate::error::{AppError, AppResult};

const PAYMENT_COLUMNS: &str = "id, tenant_id, amount, currency, status, method, transaction_ref, metadata, created_at, updated_at";
const REFUND_COLUMNS: &str = "id, payment_id, tenant_id, amount, status, reason, failure_reason, created_at, updated_at";
const WEBHOOK_LOG_COLUMNS: &str = "id, tenant_id, event_type, payload, status, attempts, note, created_at, updated_at";

/// Ledger repository - PostgreSQL implementation of the store port
#[derive(Clone)]
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct TenantRow {
    id: String,
    name: String,
    webhook_url: Option<String>,
}

#[derive(FromRow)]
struct PaymentRow {
    id: String,
    tenant_id: String,
    amount: Decimal,
    currency: String,
    status: String,
    method: Option<String>,
    transaction_ref: Option<String>,
    metadata: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = AppError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            tenant_id: row.tenant_id,
            amount: row.amount,
            currency: row.currency,
            status: row.status.parse()?,
            method: row.method,
            transaction_ref: row.transaction_ref,
            metadata: row.metadata.unwrap_or(serde_json::Value::Null),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct RefundRow {
    id: String,
    payment_id: String,
    tenant_id: String,
    amount: Decimal,
    status: String,
    reason: Option<String>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RefundRow> for Refund {
    type Error = AppError;

    fn try_from(row: RefundRow) -> Result<Self, Self::Error> {
        Ok(Refund {
            id: row.id,
            payment_id: row.payment_id,
            tenant_id: row.tenant_id,
            amount: row.amount,
            status: row.status.parse()?,
            reason: row.reason,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct WebhookLogRow {
    id: Uuid,
    tenant_id: String,
    event_type: String,
    payload: Option<serde_json::Value>,
    status: String,
    attempts: i32,
    note: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WebhookLogRow> for WebhookLog {
    type Error = AppError;

    fn try_from(row: WebhookLogRow) -> Result<Self, Self::Error> {
        Ok(WebhookLog {
            id: row.id,
            tenant_id: row.tenant_id,
            event_type: row.event_type,
            payload: row.payload.unwrap_or(serde_json::Value::Null),
            status: row.status.parse()?,
            attempts: row.attempts,
            note: row.note,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct WebhookAttemptRow {
    log_id: Uuid,
    attempt: i32,
    status: String,
    status_code: Option<i32>,
    error: Option<String>,
    duration_ms: i64,
    attempted_at: DateTime<Utc>,
}

impl TryFrom<WebhookAttemptRow> for WebhookAttempt {
    type Error = AppError;

    fn try_from(row: WebhookAttemptRow) -> Result<Self, Self::Error> {
        Ok(WebhookAttempt {
            log_id: row.log_id,
            attempt: row.attempt,
            status: row.status.parse()?,
            status_code: row.status_code,
            error: row.error,
            duration_ms: row.duration_ms,
            attempted_at: row.attempted_at,
        })
    }
}

fn status_list<S: ToString>(statuses: &[S]) -> Vec<String> {
    statuses.iter().map(ToString::to_string).collect()
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_tenant(&self, tenant_id: &str) -> AppResult<Option<Tenant>> {
        let row = sqlx::query_as::<_, TenantRow>(
            r#"
            SELECT id, name, webhook_url
            FROM tenants
            WHERE id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Tenant {
            id: row.id,
            name: row.name,
            webhook_url: row.webhook_url,
        }))
    }

    async fn insert_payment(&self, payment: NewPayment) -> AppResult<Payment> {
        let sql = format!(
            r#"
            INSERT INTO payments (id, tenant_id, amount, currency, status, method, metadata)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6)
            RETURNING {PAYMENT_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(&payment.id)
            .bind(&payment.tenant_id)
            .bind(payment.amount)
            .bind(&payment.currency)
            .bind(&payment.method)
            .bind(&payment.metadata)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn get_payment(&self, payment_id: &str) -> AppResult<Option<Payment>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1");

        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Payment::try_from)
            .transpose()
    }

    async fn transition_payment(
        &self,
        payment_id: &str,
        from: &[PaymentStatus],
        to: PaymentStatus,
        transaction_ref: Option<&str>,
    ) -> AppResult<Option<Payment>> {
        let sql = format!(
            r#"
            UPDATE payments
            SET status = $3,
                transaction_ref = COALESCE($4, transaction_ref),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($2)
            RETURNING {PAYMENT_COLUMNS}
            "#
        );

        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(payment_id)
            .bind(status_list(from))
            .bind(to.as_str())
            .bind(transaction_ref)
            .fetch_optional(&self.pool)
            .await?
            .map(Payment::try_from)
            .transpose()
    }

    async fn insert_refund(&self, refund: NewRefund) -> AppResult<Refund> {
        let sql = format!(
            r#"
            INSERT INTO refunds (id, payment_id, tenant_id, amount, status, reason)
            VALUES ($1, $2, $3, $4, 'pending', $5)
            RETURNING {REFUND_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, RefundRow>(&sql)
            .bind(&refund.id)
            .bind(&refund.payment_id)
            .bind(&refund.tenant_id)
            .bind(refund.amount)
            .bind(&refund.reason)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn get_refund(&self, refund_id: &str) -> AppResult<Option<Refund>> {
        let sql = format!("SELECT {REFUND_COLUMNS} FROM refunds WHERE id = $1");

        sqlx::query_as::<_, RefundRow>(&sql)
            .bind(refund_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Refund::try_from)
            .transpose()
    }

    async fn transition_refund(
        &self,
        refund_id: &str,
        from: &[RefundStatus],
        to: RefundStatus,
        failure_reason: Option<&str>,
    ) -> AppResult<Option<Refund>> {
        let sql = format!(
            r#"
            UPDATE refunds
            SET status = $3,
                failure_reason = COALESCE($4, failure_reason),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($2)
            RETURNING {REFUND_COLUMNS}
            "#
        );

        sqlx::query_as::<_, RefundRow>(&sql)
            .bind(refund_id)
            .bind(status_list(from))
            .bind(to.as_str())
            .bind(failure_reason)
            .fetch_optional(&self.pool)
            .await?
            .map(Refund::try_from)
            .transpose()
    }

    async fn begin_webhook_attempt(&self, log: &NewWebhookLog) -> AppResult<WebhookLog> {
        let sql = format!(
            r#"
            INSERT INTO webhook_logs (id, tenant_id, event_type, payload, status, attempts)
            VALUES ($1, $2, $3, $4, 'pending', 1)
            ON CONFLICT (id) DO UPDATE
            SET status = 'pending',
                attempts = webhook_logs.attempts + 1,
                updated_at = NOW()
            RETURNING {WEBHOOK_LOG_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, WebhookLogRow>(&sql)
            .bind(log.id)
            .bind(&log.tenant_id)
            .bind(&log.event_type)
            .bind(&log.payload)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn record_webhook_skipped(
        &self,
        log: &NewWebhookLog,
        note: &str,
    ) -> AppResult<WebhookLog> {
        let sql = format!(
            r#"
            INSERT INTO webhook_logs (id, tenant_id, event_type, payload, status, attempts, note)
            VALUES ($1, $2, $3, $4, 'skipped', 0, $5)
            ON CONFLICT (id) DO UPDATE
            SET status = CASE WHEN webhook_logs.status = 'delivered' THEN webhook_logs.status ELSE 'skipped' END,
                note = CASE WHEN webhook_logs.status = 'delivered' THEN webhook_logs.note ELSE EXCLUDED.note END,
                updated_at = NOW()
            RETURNING {WEBHOOK_LOG_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, WebhookLogRow>(&sql)
            .bind(log.id)
            .bind(&log.tenant_id)
            .bind(&log.event_type)
            .bind(&log.payload)
            .bind(note)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn finish_webhook_attempt(&self, attempt: &WebhookAttempt) -> AppResult<()> {
        // Status update and history append in one statement
        let result = sqlx::query(
            r#"
            WITH updated AS (
                UPDATE webhook_logs
                SET status = $2, updated_at = NOW()
                WHERE id = $1
                RETURNING id
            )
            INSERT INTO webhook_attempts (log_id, attempt, status, status_code, error, duration_ms, attempted_at)
            SELECT id, $3, $2, $4, $5, $6, $7 FROM updated
            "#,
        )
        .bind(attempt.log_id)
        .bind(attempt.status.as_str())
        .bind(attempt.attempt)
        .bind(attempt.status_code)
        .bind(&attempt.error)
        .bind(attempt.duration_ms)
        .bind(attempt.attempted_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Webhook log {}", attempt.log_id)));
        }

        Ok(())
    }

    async fn get_webhook_log(&self, log_id: Uuid) -> AppResult<Option<WebhookLog>> {
        let sql = format!("SELECT {WEBHOOK_LOG_COLUMNS} FROM webhook_logs WHERE id = $1");

        sqlx::query_as::<_, WebhookLogRow>(&sql)
            .bind(log_id)
            .fetch_optional(&self.pool)
            .await?
            .map(WebhookLog::try_from)
            .transpose()
    }

    async fn list_webhook_logs(
        &self,
        tenant_id: &str,
        limit: i64,
        offset: i64,
    ) -> AppResult<Page<WebhookLog>> {
        let sql = format!(
            r#"
            SELECT {WEBHOOK_LOG_COLUMNS}
            FROM webhook_logs
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#
        );

        let data = sqlx::query_as::<_, WebhookLogRow>(&sql)
            .bind(tenant_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(WebhookLog::try_from)
            .collect::<AppResult<Vec<_>>>()?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM webhook_logs WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(Page {
            data,
            total,
            limit,
            offset,
        })
    }

    async fn list_webhook_attempts(&self, log_id: Uuid) -> AppResult<Vec<WebhookAttempt>> {
        sqlx::query_as::<_, WebhookAttemptRow>(
            r#"
            SELECT log_id, attempt, status, status_code, error, duration_ms, attempted_at
            FROM webhook_attempts
            WHERE log_id = $1
            ORDER BY attempt ASC, attempted_at ASC
            "#,
        )
        .bind(log_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(WebhookAttempt::try_from)
        .collect()
    }

    async fn stuck_payments(&self, older_than: DateTime<Utc>) -> AppResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM payments
            WHERE status = 'processing' AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT 100
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn stuck_refunds(&self, older_than: DateTime<Utc>) -> AppResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM refunds
            WHERE status = 'processing' AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT 100
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}
