use anyhow::Context;
use settlement_worker::{
    api::AppState,
    bootstrap,
    config::Config,
    server,
    worker::WorkerSupervisor,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,settlement_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting settlement worker");

    let config = Config::from_env().context("failed to load configuration")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("🛑 Shutdown requested");
        signal.cancel();
    });

    let Some(pipeline) = bootstrap::initialize_with_retry(&config, &shutdown).await else {
        info!("Shutdown before initialization completed");
        return Ok(());
    };

    let supervisor = WorkerSupervisor::start(
        pipeline.queue.clone(),
        pipeline.handlers.clone(),
        pipeline.registry.clone(),
        config.worker_concurrency,
        config.poll_interval(),
        shutdown.child_token(),
    );

    let app = server::create_app(AppState {
        status: pipeline.status.clone(),
    });
    let served = server::run_server(app, &config.bind_address, shutdown.clone()).await;

    // The server only returns early on error; stop the consumers either way
    shutdown.cancel();
    supervisor.shutdown().await;

    served.context("HTTP server failed")?;
    info!("👋 Settlement worker stopped");
    Ok(())
}
