use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use super::WorkerRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Busy,
    Stopped,
}

/// Liveness of one consumer loop
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub role: WorkerRole,
    pub instance: String,
    pub state: WorkerState,
    pub last_heartbeat: DateTime<Utc>,
    pub processed: u64,
    pub failed: u64,
}

/// Process-wide view of the consumer loops, read by the status endpoint
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerSnapshot>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, role: WorkerRole, instance: &str) {
        self.workers.write().insert(
            instance.to_string(),
            WorkerSnapshot {
                role,
                instance: instance.to_string(),
                state: WorkerState::Idle,
                last_heartbeat: Utc::now(),
                processed: 0,
                failed: 0,
            },
        );
    }

    pub fn heartbeat(&self, instance: &str, state: WorkerState) {
        if let Some(worker) = self.workers.write().get_mut(instance) {
            worker.state = state;
            worker.last_heartbeat = Utc::now();
        }
    }

    /// Count one resolved envelope
    pub fn record(&self, instance: &str, succeeded: bool) {
        if let Some(worker) = self.workers.write().get_mut(instance) {
            if succeeded {
                worker.processed += 1;
            } else {
                worker.failed += 1;
            }
            worker.last_heartbeat = Utc::now();
        }
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut workers: Vec<_> = self.workers.read().values().cloned().collect();
        workers.sort_by(|a, b| a.instance.cmp(&b.instance));
        workers
    }

    pub fn any_alive(&self) -> bool {
        self.workers
            .read()
            .values()
            .any(|worker| worker.state != WorkerState::Stopped)
    }
}
