use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::consumer::consume;
use super::registry::WorkerRegistry;
use super::JobHandler;
use crate::queue::JobQueue;

/// Owns the consumer loops of this process
pub struct WorkerSupervisor {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl WorkerSupervisor {
    /// Spawn `concurrency` independent loops per handler. Each loop still
    /// holds at most one envelope at a time.
    pub fn start(
        queue: Arc<dyn JobQueue>,
        handlers: Vec<Arc<dyn JobHandler>>,
        registry: Arc<WorkerRegistry>,
        concurrency: usize,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let mut handles = Vec::new();

        for handler in handlers {
            for index in 0..concurrency.max(1) {
                let instance = format!("{}-{}", handler.role(), index);
                handles.push(consume(
                    queue.clone(),
                    handler.clone(),
                    registry.clone(),
                    instance,
                    poll_interval,
                    cancel.child_token(),
                ));
            }
        }

        info!("👷 Started {} consumer loops", handles.len());
        Self { handles, cancel }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancel every loop and wait for in-flight envelopes to be resolved
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "Consumer task panicked");
            }
        }
        info!("All consumers stopped");
    }
}
