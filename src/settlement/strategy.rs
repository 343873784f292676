use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SettlementError;
use crate::ledger::models::{Payment, Refund};

/// Result of one settlement decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum SettlementOutcome {
    Completed { transaction_ref: String },
    Failed { reason: String },
}

/// Pluggable settlement decision point. An `Err` is a transient
/// infrastructure failure; a declined settlement is `Ok(Failed)`.
#[async_trait]
pub trait SettlementStrategy: Send + Sync {
    async fn settle(&self, payment: &Payment) -> Result<SettlementOutcome, SettlementError>;

    async fn settle_refund(
        &self,
        refund: &Refund,
        payment: &Payment,
    ) -> Result<SettlementOutcome, SettlementError>;
}

/// Bound a settlement call; running out of time is a transient failure
pub async fn settle_with_timeout<F>(
    timeout: Duration,
    settlement: F,
) -> Result<SettlementOutcome, SettlementError>
where
    F: Future<Output = Result<SettlementOutcome, SettlementError>>,
{
    tokio::time::timeout(timeout, settlement)
        .await
        .map_err(|_| SettlementError::Timeout(timeout))?
}

/// Stand-in processor: waits a fixed delay, then approves with probability
/// `success_rate`
#[derive(Debug, Clone)]
pub struct SimulatedSettlement {
    pub delay: Duration,
    pub success_rate: f64,
}

impl SimulatedSettlement {
    pub fn new(delay: Duration, success_rate: f64) -> Self {
        Self {
            delay,
            success_rate: success_rate.clamp(0.0, 1.0),
        }
    }

    async fn decide(&self, prefix: &str) -> SettlementOutcome {
        tokio::time::sleep(self.delay).await;

        let roll: f64 = rand::rng().random();
        if roll < self.success_rate {
            SettlementOutcome::Completed {
                transaction_ref: format!("{}_{}", prefix, Uuid::new_v4().simple()),
            }
        } else {
            SettlementOutcome::Failed {
                reason: "declined by processor".to_string(),
            }
        }
    }
}

#[async_trait]
impl SettlementStrategy for SimulatedSettlement {
    async fn settle(&self, _payment: &Payment) -> Result<SettlementOutcome, SettlementError> {
        Ok(self.decide("txn").await)
    }

    async fn settle_refund(
        &self,
        _refund: &Refund,
        _payment: &Payment,
    ) -> Result<SettlementOutcome, SettlementError> {
        Ok(self.decide("rtxn").await)
    }
}

/// One scripted response of [`ScriptedSettlement`]
#[doc(hidden)]
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Outcome(SettlementOutcome),
    Unavailable(String),
    /// Never answers within any reasonable timeout
    Hang,
}

/// Deterministic strategy: replays scripted steps in order, then approves
/// everything. Test support, not wired into any production path.
#[doc(hidden)]
#[derive(Debug, Default)]
pub struct ScriptedSettlement {
    steps: Mutex<VecDeque<ScriptedStep>>,
    calls: AtomicU32,
}

impl ScriptedSettlement {
    pub fn new(steps: impl IntoIterator<Item = ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            calls: AtomicU32::new(0),
        }
    }

    /// Transiently unavailable `failures` times, then approves
    pub fn fail_then_succeed(failures: usize) -> Self {
        Self::new(
            std::iter::repeat(ScriptedStep::Unavailable("processor unavailable".to_string()))
                .take(failures),
        )
    }

    pub fn always(step: ScriptedStep) -> Self {
        Self::new(std::iter::repeat(step).take(1024))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn next(&self, transaction_ref: String) -> Result<SettlementOutcome, SettlementError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().pop_front();

        match step {
            None => Ok(SettlementOutcome::Completed { transaction_ref }),
            Some(ScriptedStep::Outcome(outcome)) => Ok(outcome),
            Some(ScriptedStep::Unavailable(message)) => Err(SettlementError::Unavailable(message)),
            Some(ScriptedStep::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(SettlementError::Unavailable("hung".to_string()))
            }
        }
    }
}

#[async_trait]
impl SettlementStrategy for ScriptedSettlement {
    async fn settle(&self, payment: &Payment) -> Result<SettlementOutcome, SettlementError> {
        self.next(format!("txn_{}", payment.id)).await
    }

    async fn settle_refund(
        &self,
        refund: &Refund,
        _payment: &Payment,
    ) -> Result<SettlementOutcome, SettlementError> {
        self.next(format!("rtxn_{}", refund.id)).await
    }
}
