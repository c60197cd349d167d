use crate::core::{Result, StoreError};
use crate::retry::InstanceLockedRetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Instance store configuration
///
/// Durations are kept in milliseconds so the configuration can be loaded from
/// JSON; the accessors return `Duration`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How often the lock owner's lease is extended.
    pub host_lock_renewal_period_ms: u64,

    /// How often abandoned instance locks are recovered.
    pub lock_recovery_period_ms: u64,

    /// How often runnable / activatable instances are detected.
    pub run_detection_period_ms: u64,

    /// Retry behavior when a load races another owner's lock.
    pub instance_locked_retry: InstanceLockedRetryPolicy,

    /// Maximum number of transient infrastructure retries per command.
    pub max_connection_retries: u32,

    /// Fixed delay between transient infrastructure retries.
    pub connection_retry_delay_ms: u64,

    /// Budget for opening one connection.
    pub connection_open_timeout_ms: u64,

    /// Timeout used when a caller does not provide one.
    pub default_command_timeout_ms: u64,

    /// Allow every transient code to be retried under an ambient transaction,
    /// not only the codes whose rule permits it. On by default; turn it off to
    /// retry only the transaction-safe codes.
    pub retry_any_transient_under_transaction: bool,

    /// Delay used by the basic (constant) lock retry strategy.
    pub constant_retry_delay_ms: u64,

    /// Multiplier of the aggressive (exponential) lock retry strategy.
    pub backoff_multiplier_ms: u64,

    /// Upper bound of the aggressive lock retry strategy.
    pub backoff_cap_ms: u64,
}

impl StoreConfig {
    pub fn new() -> Self {
        Self {
            host_lock_renewal_period_ms: 30_000,
            lock_recovery_period_ms: 30_000,
            run_detection_period_ms: 5_000,
            instance_locked_retry: InstanceLockedRetryPolicy::NoRetry,
            max_connection_retries: 4,
            connection_retry_delay_ms: 1_000,
            connection_open_timeout_ms: 15_000,
            default_command_timeout_ms: 30_000,
            retry_any_transient_under_transaction: true,
            constant_retry_delay_ms: 5_000,
            backoff_multiplier_ms: 100,
            backoff_cap_ms: 10_000,
        }
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| StoreError::InvalidConfig(format!("parse store config: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the lease renewal period. Recovery follows it unless set explicitly afterwards.
    pub fn host_lock_renewal_period(mut self, period: Duration) -> Self {
        self.host_lock_renewal_period_ms = period.as_millis() as u64;
        self.lock_recovery_period_ms = self.host_lock_renewal_period_ms;
        self
    }

    pub fn lock_recovery_period(mut self, period: Duration) -> Self {
        self.lock_recovery_period_ms = period.as_millis() as u64;
        self
    }

    pub fn run_detection_period(mut self, period: Duration) -> Self {
        self.run_detection_period_ms = period.as_millis() as u64;
        self
    }

    pub fn instance_locked_retry(mut self, policy: InstanceLockedRetryPolicy) -> Self {
        self.instance_locked_retry = policy;
        self
    }

    pub fn max_connection_retries(mut self, max: u32) -> Self {
        self.max_connection_retries = max;
        self
    }

    pub fn connection_retry_delay(mut self, delay: Duration) -> Self {
        self.connection_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn connection_open_timeout(mut self, timeout: Duration) -> Self {
        self.connection_open_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn default_command_timeout(mut self, timeout: Duration) -> Self {
        self.default_command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn retry_any_transient_under_transaction(mut self, enabled: bool) -> Self {
        self.retry_any_transient_under_transaction = enabled;
        self
    }

    pub fn constant_retry_delay(mut self, delay: Duration) -> Self {
        self.constant_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn backoff(mut self, multiplier: Duration, cap: Duration) -> Self {
        self.backoff_multiplier_ms = multiplier.as_millis() as u64;
        self.backoff_cap_ms = cap.as_millis() as u64;
        self
    }

    pub fn host_lock_renewal_period_duration(&self) -> Duration {
        Duration::from_millis(self.host_lock_renewal_period_ms)
    }

    pub fn lock_recovery_period_duration(&self) -> Duration {
        Duration::from_millis(self.lock_recovery_period_ms)
    }

    pub fn run_detection_period_duration(&self) -> Duration {
        Duration::from_millis(self.run_detection_period_ms)
    }

    pub fn connection_retry_delay_duration(&self) -> Duration {
        Duration::from_millis(self.connection_retry_delay_ms)
    }

    pub fn connection_open_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.connection_open_timeout_ms)
    }

    pub fn default_command_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.default_command_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("host_lock_renewal_period_ms", self.host_lock_renewal_period_ms),
            ("lock_recovery_period_ms", self.lock_recovery_period_ms),
            ("run_detection_period_ms", self.run_detection_period_ms),
            ("connection_open_timeout_ms", self.connection_open_timeout_ms),
            ("default_command_timeout_ms", self.default_command_timeout_ms),
        ];
        for (name, value) in periods {
            if value == 0 {
                return Err(StoreError::InvalidConfig(format!("{} must be > 0", name)));
            }
        }

        if self.connection_open_timeout_ms > self.default_command_timeout_ms {
            return Err(StoreError::InvalidConfig(
                "connection_open_timeout_ms cannot exceed default_command_timeout_ms".to_string(),
            ));
        }

        if self.backoff_multiplier_ms > self.backoff_cap_ms {
            return Err(StoreError::InvalidConfig(
                "backoff_multiplier_ms cannot exceed backoff_cap_ms".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new()
    }
}
