use super::{CommandOutcome, ErrorClassification, StoreCommand, StoreConnector};
use crate::config::StoreConfig;
use crate::core::{FailurePhase, Result, StoreError};
use crate::transaction::AmbientTransaction;
use log::warn;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tracing::{Instrument, Level, event, info_span};

/// Error code the executor reports when opening a connection exceeds its budget.
pub const OPEN_TIMEOUT_CODE: i32 = -2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub open_timeout: Duration,
}

impl ExecutorSettings {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            max_retries: config.max_connection_retries,
            retry_delay: config.connection_retry_delay_duration(),
            open_timeout: config.connection_open_timeout_duration(),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

/// Runs commands against the remote store and transparently re-issues them
/// after transient infrastructure failures.
///
/// Retries use a fixed delay and a bounded attempt count; lock contention is
/// not handled here. Every attempt uses a fresh connection which is closed
/// as soon as the attempt ends.
pub struct ResilientCommandExecutor {
    connector: Arc<dyn StoreConnector>,
    classification: ErrorClassification,
    settings: ExecutorSettings,
}

impl ResilientCommandExecutor {
    pub fn new(
        connector: Arc<dyn StoreConnector>,
        classification: ErrorClassification,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            connector,
            classification,
            settings,
        }
    }

    pub fn from_config(connector: Arc<dyn StoreConnector>, config: &StoreConfig) -> Self {
        let classification = ErrorClassification::standard()
            .retry_any_under_transaction(config.retry_any_transient_under_transaction);
        Self::new(connector, classification, ExecutorSettings::from_config(config))
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Executes `command` within `budget`, retrying transient failures.
    ///
    /// The error of the last attempt is returned unchanged.
    pub async fn execute(
        &self,
        command: StoreCommand,
        transaction: Option<&AmbientTransaction>,
        budget: Duration,
    ) -> Result<CommandOutcome> {
        let deadline = Instant::now() + budget;
        let span = info_span!(
            "store.command",
            kind = %command.kind,
            instance_id = ?command.instance_id
        );
        self.execute_until(command, transaction, deadline)
            .instrument(span)
            .await
    }

    pub(crate) async fn execute_until(
        &self,
        mut command: StoreCommand,
        transaction: Option<&AmbientTransaction>,
        deadline: Instant,
    ) -> Result<CommandOutcome> {
        loop {
            let (phase, err) = match self.attempt(&command, transaction, deadline).await {
                Ok(outcome) => return Ok(outcome),
                Err(failure) => failure,
            };

            if !self
                .classification
                .is_retryable(&err, phase, transaction.is_some())
            {
                return Err(err);
            }

            if command.retry_count >= self.settings.max_retries {
                warn!(
                    "{} exhausted {} transient retries: {}",
                    command.procedure, self.settings.max_retries, err
                );
                return Err(err);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining <= self.settings.retry_delay {
                event!(
                    Level::DEBUG,
                    remaining_ms = remaining.as_millis() as u64,
                    "no time left for another transient retry"
                );
                return Err(err);
            }

            warn!(
                "{} transient failure during {} (retry {} of {}): {}",
                command.procedure,
                phase,
                command.retry_count + 1,
                self.settings.max_retries,
                err
            );
            sleep(self.settings.retry_delay).await;
            command = command.clone_for_retry();
        }
    }

    async fn attempt(
        &self,
        command: &StoreCommand,
        transaction: Option<&AmbientTransaction>,
        deadline: Instant,
    ) -> std::result::Result<CommandOutcome, (FailurePhase, StoreError)> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err((
                FailurePhase::Open,
                StoreError::Timeout(format!("{} ran out of time", command.procedure)),
            ));
        }

        let open_budget = self.settings.open_timeout.min(remaining);
        let mut session = match timeout(open_budget, self.connector.open()).await {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => return Err((FailurePhase::Open, err)),
            Err(_) => {
                return Err((
                    FailurePhase::Open,
                    StoreError::TransientInfra {
                        code: OPEN_TIMEOUT_CODE,
                        phase: FailurePhase::Open,
                        message: format!("connection open exceeded {}ms", open_budget.as_millis()),
                    },
                ));
            }
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = match timeout(remaining, session.execute(command, transaction)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(format!(
                "{} did not complete in time",
                command.procedure
            ))),
        };
        session.close().await;

        result.map_err(|err| (FailurePhase::Execute, err))
    }
}
