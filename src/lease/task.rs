use super::{InstanceStoreEvent, LeaseOwnershipManager};
use crate::command::{CommandKind, CommandOutcome, ResilientCommandExecutor, StoreCommand, params};
use crate::core::{LockOwnerIdentity, StoreError};
use crate::timer::CancellableTimer;
use chrono::Utc;
use futures::FutureExt;
use log::warn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{Instrument, Level, event, info_span};

/// What a task does after its command failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskErrorAction {
    /// Try again after the base interval.
    Reschedule,
    /// The lease cannot be trusted any more.
    MarkOwnerLost,
    /// Stop firing; the owner is left alone.
    Stop,
}

/// The command a lease task runs and how it reacts to the result.
pub trait LeaseTaskHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn command(&self, owner: &LockOwnerIdentity) -> StoreCommand;

    fn auto_reschedule(&self) -> bool {
        true
    }

    /// Interval requested by the store for the next run, if any.
    fn next_interval(&self, _outcome: &CommandOutcome) -> Option<Duration> {
        None
    }

    fn event(&self, _owner: &LockOwnerIdentity, _outcome: &CommandOutcome) -> Option<InstanceStoreEvent> {
        None
    }

    /// Fatal errors stop the task; anything else is retried on schedule.
    fn on_error(&self, err: &StoreError) -> TaskErrorAction {
        if err.is_fatal() {
            TaskErrorAction::Stop
        } else {
            TaskErrorAction::Reschedule
        }
    }
}

fn owner_command(kind: CommandKind, owner: &LockOwnerIdentity) -> StoreCommand {
    StoreCommand::new(kind).with_parameter(params::SURROGATE_OWNER_ID, owner.surrogate_owner_id)
}

/// Extends the owner's lease. A failed renewal loses the owner.
pub struct RenewLockHandler {
    lease: Duration,
}

impl RenewLockHandler {
    pub fn new(lease: Duration) -> Self {
        Self { lease }
    }
}

impl LeaseTaskHandler for RenewLockHandler {
    fn name(&self) -> &'static str {
        "lease-renewal"
    }

    fn command(&self, owner: &LockOwnerIdentity) -> StoreCommand {
        owner_command(CommandKind::ExtendLock, owner)
            .with_parameter(params::LOCK_TIMEOUT_MS, self.lease.as_millis() as u64)
    }

    fn on_error(&self, err: &StoreError) -> TaskErrorAction {
        if err.is_fatal() {
            TaskErrorAction::Stop
        } else {
            TaskErrorAction::MarkOwnerLost
        }
    }
}

pub struct RecoverLocksHandler;

impl LeaseTaskHandler for RecoverLocksHandler {
    fn name(&self) -> &'static str {
        "lock-recovery"
    }

    fn command(&self, owner: &LockOwnerIdentity) -> StoreCommand {
        owner_command(CommandKind::RecoverInstanceLocks, owner)
    }
}

pub struct DetectRunnableHandler;

impl LeaseTaskHandler for DetectRunnableHandler {
    fn name(&self) -> &'static str {
        "detect-runnable"
    }

    fn command(&self, owner: &LockOwnerIdentity) -> StoreCommand {
        owner_command(CommandKind::DetectRunnableInstances, owner)
    }

    fn next_interval(&self, outcome: &CommandOutcome) -> Option<Duration> {
        outcome.next_detection_in
    }

    fn event(&self, owner: &LockOwnerIdentity, outcome: &CommandOutcome) -> Option<InstanceStoreEvent> {
        (outcome.rows_affected > 0).then(|| InstanceStoreEvent::HasRunnableInstance {
            owner_id: owner.owner_id,
            count: outcome.rows_affected,
            detected_at: Utc::now(),
        })
    }
}

pub struct DetectActivatableHandler;

impl LeaseTaskHandler for DetectActivatableHandler {
    fn name(&self) -> &'static str {
        "detect-activatable"
    }

    fn command(&self, owner: &LockOwnerIdentity) -> StoreCommand {
        owner_command(CommandKind::DetectActivatableInstances, owner)
    }

    fn next_interval(&self, outcome: &CommandOutcome) -> Option<Duration> {
        outcome.next_detection_in
    }

    fn event(&self, owner: &LockOwnerIdentity, outcome: &CommandOutcome) -> Option<InstanceStoreEvent> {
        (outcome.rows_affected > 0).then(|| InstanceStoreEvent::HasActivatableInstance {
            owner_id: owner.owner_id,
            count: outcome.rows_affected,
            detected_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTaskState {
    pub interval_base: Duration,
    pub timeout: Duration,
    pub cancelled: bool,
    pub timer_armed: bool,
}

/// Timer-driven recurring command bound to one lock owner.
///
/// Stops for good once cancelled or once the owner it runs for is no longer
/// valid.
pub struct PeriodicLeaseTask {
    handler: Box<dyn LeaseTaskHandler>,
    owner: LockOwnerIdentity,
    state: Mutex<LeaseTaskState>,
    timer: CancellableTimer,
    manager: Weak<LeaseOwnershipManager>,
    executor: Arc<ResilientCommandExecutor>,
    fire_count: AtomicU64,
}

impl PeriodicLeaseTask {
    pub fn new(
        handler: Box<dyn LeaseTaskHandler>,
        owner: LockOwnerIdentity,
        interval_base: Duration,
        timeout: Duration,
        manager: Weak<LeaseOwnershipManager>,
        executor: Arc<ResilientCommandExecutor>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let timer = CancellableTimer::new(
                handler.name(),
                Arc::new(move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(task) = weak.upgrade() {
                            task.fire().await;
                        }
                    }
                    .boxed()
                }),
            );
            Self {
                handler,
                owner,
                state: Mutex::new(LeaseTaskState {
                    interval_base,
                    timeout,
                    cancelled: false,
                    timer_armed: false,
                }),
                timer,
                manager,
                executor,
                fire_count: AtomicU64::new(0),
            }
        })
    }

    pub fn name(&self) -> &'static str {
        self.handler.name()
    }

    pub fn state(&self) -> LeaseTaskState {
        *self.lock_state()
    }

    /// Number of times the timer fired while the task was live.
    pub fn fire_count(&self) -> u64 {
        self.fire_count.load(Ordering::SeqCst)
    }

    /// Arms the timer for `min(interval_override, interval_base)`, or right
    /// away. Ignored once cancelled.
    pub fn reset_timer(&self, fire_immediately: bool, interval_override: Option<Duration>) {
        let mut state = self.lock_state();
        if state.cancelled {
            return;
        }
        let delay = if fire_immediately {
            Duration::ZERO
        } else {
            interval_override.map_or(state.interval_base, |interval| {
                interval.min(state.interval_base)
            })
        };
        state.timer_armed = true;
        self.timer.set(delay);
    }

    /// Disables the task permanently.
    pub fn cancel_timer(&self) {
        let mut state = self.lock_state();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        state.timer_armed = false;
        self.timer.cancel();
    }

    fn lock_state(&self) -> MutexGuard<'_, LeaseTaskState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn fire(self: Arc<Self>) {
        let timeout = {
            let mut state = self.lock_state();
            if state.cancelled {
                return;
            }
            state.timer_armed = false;
            state.timeout
        };
        self.fire_count.fetch_add(1, Ordering::SeqCst);

        let Some(manager) = self.manager.upgrade() else {
            self.cancel_timer();
            return;
        };
        if !manager.is_valid(self.owner.surrogate_owner_id) {
            event!(
                Level::DEBUG,
                task = self.name(),
                surrogate_owner_id = self.owner.surrogate_owner_id,
                "lock owner no longer valid, stopping task"
            );
            self.cancel_timer();
            return;
        }

        let span = info_span!(
            "store.lease_task",
            task = self.name(),
            surrogate_owner_id = self.owner.surrogate_owner_id
        );
        let command = self.handler.command(&self.owner);
        let result = self
            .executor
            .execute(command, None, timeout)
            .instrument(span)
            .await;

        match result {
            Ok(outcome) => {
                if let Some(store_event) = self.handler.event(&self.owner, &outcome) {
                    manager.publish(store_event);
                }
                if self.handler.auto_reschedule() {
                    self.reset_timer(false, self.handler.next_interval(&outcome));
                }
            }
            Err(err) => match self.handler.on_error(&err) {
                TaskErrorAction::Reschedule => {
                    warn!("{} failed, rescheduling: {}", self.name(), err);
                    self.reset_timer(false, None);
                }
                TaskErrorAction::MarkOwnerLost => {
                    warn!("{} failed, lock owner lost: {}", self.name(), err);
                    if let Err(mark_err) = manager
                        .mark_owner_lost(self.owner.surrogate_owner_id, None)
                        .await
                    {
                        event!(Level::ERROR, error = %mark_err, "could not mark lock owner lost");
                    }
                    self.cancel_timer();
                }
                TaskErrorAction::Stop => {
                    event!(Level::ERROR, task = self.name(), error = %err, "lease task stopped");
                    self.cancel_timer();
                }
            },
        }
    }
}

impl Drop for PeriodicLeaseTask {
    fn drop(&mut self) {
        self.timer.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renewal_command_carries_owner_and_lease() {
        let owner = LockOwnerIdentity::new(uuid::Uuid::new_v4(), 12);
        let command = RenewLockHandler::new(Duration::from_secs(60)).command(&owner);

        assert_eq!(command.kind, CommandKind::ExtendLock);
        assert_eq!(command.parameter_i64(params::SURROGATE_OWNER_ID), Some(12));
        assert_eq!(command.parameter_i64(params::LOCK_TIMEOUT_MS), Some(60_000));
    }

    #[test]
    fn test_default_error_actions() {
        let err = StoreError::Permanent("boom".into());
        assert_eq!(
            RenewLockHandler::new(Duration::from_secs(1)).on_error(&err),
            TaskErrorAction::MarkOwnerLost
        );
        assert_eq!(RecoverLocksHandler.on_error(&err), TaskErrorAction::Reschedule);
        assert_eq!(DetectRunnableHandler.on_error(&err), TaskErrorAction::Reschedule);
    }

    #[test]
    fn test_fatal_error_stops_every_task() {
        let err = StoreError::Fatal("out of memory".into());
        assert_eq!(
            RenewLockHandler::new(Duration::from_secs(1)).on_error(&err),
            TaskErrorAction::Stop
        );
        assert_eq!(RecoverLocksHandler.on_error(&err), TaskErrorAction::Stop);
        assert_eq!(DetectActivatableHandler.on_error(&err), TaskErrorAction::Stop);
    }

    #[test]
    fn test_detection_reports_work_and_interval() {
        let owner = LockOwnerIdentity::new(uuid::Uuid::new_v4(), 3);
        let idle = CommandOutcome::default();
        assert!(DetectActivatableHandler.event(&owner, &idle).is_none());

        let busy = CommandOutcome {
            rows_affected: 2,
            next_detection_in: Some(Duration::from_millis(250)),
            ..CommandOutcome::default()
        };
        assert!(matches!(
            DetectActivatableHandler.event(&owner, &busy),
            Some(InstanceStoreEvent::HasActivatableInstance { count: 2, .. })
        ));
        assert_eq!(
            DetectRunnableHandler.next_interval(&busy),
            Some(Duration::from_millis(250))
        );
    }
}
