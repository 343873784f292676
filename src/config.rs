use std::time::Duration;

use serde::Deserialize;

use crate::retry::{RetryPolicies, RetryPolicy};

/// Process configuration, read from the environment (and `.env` via dotenv).
///
/// Every key maps to the upper-case environment variable of the same name,
/// e.g. `payment_max_attempts` is set with `PAYMENT_MAX_ATTEMPTS`.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub run_migrations: bool,
    pub db_max_connections: u32,

    pub poll_interval_ms: u64,
    pub visibility_timeout_secs: u64,
    pub worker_concurrency: usize,

    pub payment_max_attempts: u32,
    pub refund_max_attempts: u32,
    pub webhook_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    pub settlement_timeout_secs: u64,
    pub webhook_timeout_secs: u64,
    pub simulated_settlement_delay_ms: u64,
    pub simulated_success_rate: f64,

    pub init_retry_secs: u64,
    pub stuck_after_secs: u64,

    #[serde(default)]
    pub webhook_signing_secret: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .set_default("database_url", "postgresql://localhost/payment_gateway")?
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("run_migrations", false)?
            .set_default("db_max_connections", 20)?
            .set_default("poll_interval_ms", 500)?
            .set_default("visibility_timeout_secs", 300)?
            .set_default("worker_concurrency", 1)?
            .set_default("payment_max_attempts", 3)?
            .set_default("refund_max_attempts", 3)?
            .set_default("webhook_max_attempts", 3)?
            .set_default("retry_base_delay_ms", 1000)?
            .set_default("retry_max_delay_ms", 60_000)?
            .set_default("settlement_timeout_secs", 30)?
            .set_default("webhook_timeout_secs", 10)?
            .set_default("simulated_settlement_delay_ms", 2000)?
            .set_default("simulated_success_rate", 1.0)?
            .set_default("init_retry_secs", 5)?
            .set_default("stuck_after_secs", 600)?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn retry_policies(&self) -> RetryPolicies {
        let policy = |max_attempts| RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter: true,
        };

        RetryPolicies {
            payment: policy(self.payment_max_attempts),
            refund: policy(self.refund_max_attempts),
            webhook: policy(self.webhook_max_attempts),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn settlement_timeout(&self) -> Duration {
        Duration::from_secs(self.settlement_timeout_secs)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    pub fn init_retry_interval(&self) -> Duration {
        Duration::from_secs(self.init_retry_secs)
    }

    pub fn stuck_after(&self) -> Duration {
        Duration::from_secs(self.stuck_after_secs)
    }
}
