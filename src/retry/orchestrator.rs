use super::{PendingRetry, RetryDelayStrategy, RetryScheduler, RetryWake};
use crate::command::{CommandOutcome, ResilientCommandExecutor, StoreCommand};
use crate::core::{Result, StoreError};
use crate::transaction::AmbientTransaction;
use log::warn;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{Instrument, Level, event, info_span};

/// Decides whether new retries may still be parked.
///
/// Retries are refused once the lock owner they would run under is gone.
pub trait RetryGate: Send + Sync {
    fn accepts_retries(&self) -> bool;
}

/// Wraps one logical lock-sensitive command and re-issues it after lock
/// contention, within the caller's timeout.
pub struct LockContentionRetryOrchestrator {
    executor: Arc<ResilientCommandExecutor>,
    scheduler: Arc<RetryScheduler>,
    strategy: Arc<dyn RetryDelayStrategy>,
    gate: Arc<dyn RetryGate>,
}

impl LockContentionRetryOrchestrator {
    pub fn new(
        executor: Arc<ResilientCommandExecutor>,
        scheduler: Arc<RetryScheduler>,
        strategy: Arc<dyn RetryDelayStrategy>,
        gate: Arc<dyn RetryGate>,
    ) -> Self {
        Self {
            executor,
            scheduler,
            strategy,
            gate,
        }
    }

    /// Runs `command` until it succeeds, fails with a non-contention error, or
    /// can no longer be retried in time.
    ///
    /// When the budget runs out after contention was observed, the last
    /// contention error is returned instead of a timeout. Contention that
    /// reports a reclaimable lock version is returned at once.
    pub async fn try_command(
        &self,
        command: StoreCommand,
        transaction: Option<&AmbientTransaction>,
        budget: Duration,
    ) -> Result<CommandOutcome> {
        let span = info_span!(
            "store.lock_retry",
            kind = %command.kind,
            instance_id = ?command.instance_id
        );
        self.run(command, transaction, Instant::now() + budget)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        command: StoreCommand,
        transaction: Option<&AmbientTransaction>,
        deadline: Instant,
    ) -> Result<CommandOutcome> {
        let mut attempt = 0u32;
        let mut last_contention: Option<StoreError> = None;

        loop {
            let err = match self
                .executor
                .execute_until(command.clone(), transaction, deadline)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };

            if !err.is_contention() {
                return Err(match (err, last_contention) {
                    (StoreError::Timeout(_), Some(contention)) => contention,
                    (err, _) => err,
                });
            }

            // An abandoned lock is reclaimed by the caller, not waited out.
            if err.reclaimable_lock_version().is_some() {
                return Err(err);
            }

            attempt += 1;
            let delay = self.strategy.retry_delay(attempt);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if delay >= remaining {
                event!(
                    Level::DEBUG,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    remaining_ms = remaining.as_millis() as u64,
                    "lock retry would exceed timeout"
                );
                return Err(err);
            }
            if !self.gate.accepts_retries() {
                return Err(err);
            }

            warn!(
                "{} hit a locked instance (attempt {}), retrying in {}ms",
                command.procedure,
                attempt,
                delay.as_millis()
            );
            let (pending, waiter) = PendingRetry::new(command.instance_id, attempt);
            let retry_id = pending.retry_id;
            self.scheduler.enqueue(pending, delay)?;
            // The owner may have been lost after the gate check, with the
            // queue already drained.
            if !self.gate.accepts_retries() && self.scheduler.cancel(retry_id)? {
                return Err(err);
            }
            last_contention = Some(err);

            match waiter.await {
                Ok(RetryWake::Fire) => continue,
                Ok(RetryWake::Abort) => {
                    return Err(last_contention.unwrap_or(StoreError::RetryAborted));
                }
                Err(_) => return Err(StoreError::RetryAborted),
            }
        }
    }
}
