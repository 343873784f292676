// Retry / backoff policy shared by every queue.
//
// An envelope is retried while `attempts < max_attempts`; the nack that
// observes `attempts == max_attempts` dead-letters it. Redelivery is delayed
// by exponential backoff with full jitter instead of an immediate requeue.

use std::time::Duration;

use rand::Rng;

use crate::queue::QueueName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total deliveries allowed for one envelope, first attempt included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    DeadLetter,
}

impl RetryPolicy {
    /// Zero-delay requeue to the tail of the queue
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Same backoff with another attempt budget, e.g. an envelope whose
    /// producer overrode the queue default
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Upper bound of the delay before redelivering after `attempt` failed
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }

        let ceiling_ms = ceiling.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(0..=ceiling_ms))
    }

    /// Decide the fate of an envelope that failed its `attempts`-th delivery
    pub fn decide(&self, attempts: u32) -> RetryDecision {
        if self.should_retry(attempts) {
            RetryDecision::Retry {
                delay: self.delay_for(attempts),
            }
        } else {
            RetryDecision::DeadLetter
        }
    }
}

/// Per-queue retry policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicies {
    pub payment: RetryPolicy,
    pub refund: RetryPolicy,
    pub webhook: RetryPolicy,
}

impl RetryPolicies {
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            payment: policy,
            refund: policy,
            webhook: policy,
        }
    }

    pub fn for_queue(&self, queue: QueueName) -> &RetryPolicy {
        match queue {
            QueueName::PaymentProcessing => &self.payment,
            QueueName::RefundProcessing => &self.refund,
            QueueName::WebhookDelivery => &self.webhook,
        }
    }
}
