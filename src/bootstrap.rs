use std::{future::Future, sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    config::Config,
    error::AppResult,
    intake::Intake,
    ledger::{LedgerRepository, LedgerStore},
    queue::{JobQueue, PgJobQueue},
    settlement::{PaymentSettlementWorker, RefundSettlementWorker, SettlementStrategy, SimulatedSettlement},
    status::StatusService,
    webhook::{HttpWebhookClient, WebhookDispatchWorker, WebhookTransport},
    worker::{JobHandler, WorkerRegistry},
};

/// Process-scoped pipeline components, wired once and shared by every
/// consumer loop and the HTTP surface
pub struct Pipeline {
    pub ledger: Arc<dyn LedgerStore>,
    pub queue: Arc<dyn JobQueue>,
    pub registry: Arc<WorkerRegistry>,
    pub intake: Intake,
    pub status: StatusService,
    pub handlers: Vec<Arc<dyn JobHandler>>,
}

/// Wire the workers around the given store, queue and outbound capabilities
pub fn build_pipeline(
    config: &Config,
    ledger: Arc<dyn LedgerStore>,
    queue: Arc<dyn JobQueue>,
    strategy: Arc<dyn SettlementStrategy>,
    transport: Arc<dyn WebhookTransport>,
) -> Pipeline {
    let registry = Arc::new(WorkerRegistry::new());

    let handlers: Vec<Arc<dyn JobHandler>> = vec![
        Arc::new(PaymentSettlementWorker::new(
            ledger.clone(),
            queue.clone(),
            strategy.clone(),
            config.settlement_timeout(),
        )),
        Arc::new(RefundSettlementWorker::new(
            ledger.clone(),
            queue.clone(),
            strategy,
            config.settlement_timeout(),
        )),
        Arc::new(WebhookDispatchWorker::new(
            ledger.clone(),
            transport,
            config.webhook_timeout(),
        )),
    ];

    Pipeline {
        intake: Intake::new(ledger.clone(), queue.clone()),
        status: StatusService::new(
            ledger.clone(),
            queue.clone(),
            registry.clone(),
            config.stuck_after(),
        ),
        ledger,
        queue,
        registry,
        handlers,
    }
}

pub async fn initialize_database(config: &Config) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.database_url)
        .await?;

    info!("✓ Database pool configured: {} max connections", config.db_max_connections);

    if config.run_migrations {
        info!("🔄 Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
    }

    info!("✓ Database initialized");
    Ok(pool)
}

/// Connect to PostgreSQL and wire the production pipeline
pub async fn initialize_pipeline(config: &Config) -> AppResult<Pipeline> {
    info!("Initializing pipeline components ...");

    let pool = initialize_database(config).await?;

    let ledger: Arc<dyn LedgerStore> = Arc::new(LedgerRepository::new(pool.clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(
        pool,
        config.retry_policies(),
        config.visibility_timeout(),
    ));

    let strategy: Arc<dyn SettlementStrategy> = Arc::new(SimulatedSettlement::new(
        Duration::from_millis(config.simulated_settlement_delay_ms),
        config.simulated_success_rate,
    ));
    info!(
        "✅ Simulated settlement: {}ms delay, {:.0}% success",
        config.simulated_settlement_delay_ms,
        config.simulated_success_rate * 100.0
    );

    let transport: Arc<dyn WebhookTransport> = Arc::new(HttpWebhookClient::new(
        config.webhook_timeout(),
        config.webhook_signing_secret.clone(),
    )?);
    if config.webhook_signing_secret.is_some() {
        info!("🔏 Webhook signing enabled");
    }

    Ok(build_pipeline(config, ledger, queue, strategy, transport))
}

/// Retry initialization on a fixed interval until it succeeds. Returns `None`
/// only when cancelled first.
pub async fn initialize_with_retry(config: &Config, cancel: &CancellationToken) -> Option<Pipeline> {
    retry_until_ready(config.init_retry_interval(), cancel, || initialize_pipeline(config)).await
}

/// Run `init` until it succeeds, sleeping `interval` after each failure.
/// Failures are logged, never propagated.
pub async fn retry_until_ready<T, F, Fut>(
    interval: Duration,
    cancel: &CancellationToken,
    mut init: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    loop {
        match init().await {
            Ok(ready) => return Some(ready),
            Err(e) => {
                error!(error = %e, "❌ Initialization failed, retrying in {:?}", interval);
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => return None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_init_is_retried_until_it_succeeds() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let cancel = CancellationToken::new();

        let ready = retry_until_ready(Duration::from_millis(5), &cancel, move || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= 3 {
                return Err(AppError::Database(sqlx::Error::PoolTimedOut));
            }
            Ok(attempt)
        })
        .await;

        assert_eq!(ready, Some(4));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retrying() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let ready: Option<()> = retry_until_ready(Duration::from_secs(60), &cancel, move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Database(sqlx::Error::PoolTimedOut))
        })
        .await;

        assert!(ready.is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
