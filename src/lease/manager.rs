use super::task::{
    DetectActivatableHandler, DetectRunnableHandler, LeaseTaskHandler, PeriodicLeaseTask,
    RecoverLocksHandler, RenewLockHandler,
};
use super::{HandleRegistry, InstanceStoreEvent};
use crate::command::ResilientCommandExecutor;
use crate::config::StoreConfig;
use crate::core::{HandleId, LockOwnerIdentity, NO_SURROGATE_OWNER, Result};
use crate::retry::{RetryGate, RetryScheduler};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{Level, event};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

/// Periods and timeouts of the background lease tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSchedule {
    pub renewal_period: Duration,
    pub recovery_period: Duration,
    pub detection_period: Duration,
    pub command_timeout: Duration,
}

impl LeaseSchedule {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            renewal_period: config.host_lock_renewal_period_duration(),
            recovery_period: config.lock_recovery_period_duration(),
            detection_period: config.run_detection_period_duration(),
            command_timeout: config.default_command_timeout_duration(),
        }
    }

    /// Lease requested from the store; two renewal periods so one missed
    /// renewal does not lose the owner.
    pub fn lease_duration(&self) -> Duration {
        self.renewal_period * 2
    }
}

#[derive(Debug)]
struct OwnerState {
    owner_id: Option<Uuid>,
    surrogate_owner_id: i64,
    owner_handle: Option<HandleId>,
}

struct LeaseTaskSet {
    renewal: Arc<PeriodicLeaseTask>,
    recovery: Arc<PeriodicLeaseTask>,
    detection: Option<Arc<PeriodicLeaseTask>>,
}

impl LeaseTaskSet {
    fn tasks(&self) -> Vec<Arc<PeriodicLeaseTask>> {
        let mut tasks = vec![self.renewal.clone(), self.recovery.clone()];
        tasks.extend(self.detection.clone());
        tasks
    }

    fn cancel(&self) {
        for task in self.tasks() {
            task.cancel_timer();
        }
    }
}

/// Proof that the caller holds the modification lock.
pub struct ModificationGuard<'a> {
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

/// Holds the lock owner of one store and the background tasks that keep its
/// lease alive.
///
/// Lock order: the modification lock may be held while the retry heap lock is
/// taken (owner loss aborts parked retries), never the other way round. The
/// owner and task mutexes are leaf locks.
pub struct LeaseOwnershipManager {
    weak_self: Weak<Self>,
    owner: Mutex<OwnerState>,
    modification: tokio::sync::Mutex<()>,
    tasks: Mutex<Option<LeaseTaskSet>>,
    executor: Arc<ResilientCommandExecutor>,
    scheduler: Arc<RetryScheduler>,
    registry: Arc<HandleRegistry>,
    schedule: LeaseSchedule,
    events: broadcast::Sender<InstanceStoreEvent>,
    owners_lost: AtomicU64,
}

impl LeaseOwnershipManager {
    pub fn new(
        executor: Arc<ResilientCommandExecutor>,
        scheduler: Arc<RetryScheduler>,
        registry: Arc<HandleRegistry>,
        schedule: LeaseSchedule,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|weak_self: &Weak<Self>| Self {
            weak_self: weak_self.clone(),
            owner: Mutex::new(OwnerState {
                owner_id: None,
                surrogate_owner_id: NO_SURROGATE_OWNER,
                owner_handle: None,
            }),
            modification: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(None),
            executor,
            scheduler,
            registry,
            schedule,
            events,
            owners_lost: AtomicU64::new(0),
        })
    }

    pub fn schedule(&self) -> &LeaseSchedule {
        &self.schedule
    }

    /// Waits for the modification lock. Waiters are served in FIFO order.
    pub async fn take_modification_lock(&self) -> ModificationGuard<'_> {
        ModificationGuard {
            _guard: self.modification.lock().await,
        }
    }

    pub fn return_modification_lock(&self, guard: ModificationGuard<'_>) {
        drop(guard);
    }

    fn lock_owner(&self) -> MutexGuard<'_, OwnerState> {
        self.owner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn surrogate_owner_id(&self) -> i64 {
        self.lock_owner().surrogate_owner_id
    }

    pub fn owner(&self) -> Option<LockOwnerIdentity> {
        let owner = self.lock_owner();
        match owner.owner_id {
            Some(owner_id) if owner.surrogate_owner_id != NO_SURROGATE_OWNER => {
                Some(LockOwnerIdentity::new(owner_id, owner.surrogate_owner_id))
            }
            _ => None,
        }
    }

    /// True while `surrogate_owner_id` is the current owner and its owner
    /// record is still registered.
    pub fn is_valid(&self, surrogate_owner_id: i64) -> bool {
        surrogate_owner_id != NO_SURROGATE_OWNER
            && self.surrogate_owner_id() == surrogate_owner_id
            && self.registry.owners_exist()
    }

    /// Installs a freshly created owner and starts its background tasks.
    ///
    /// Activatable detection wins when both detection kinds are requested.
    /// Every task fires once right away.
    pub fn mark_owner_created(
        &self,
        _held: &ModificationGuard<'_>,
        owner_id: Uuid,
        surrogate_owner_id: i64,
        owner_handle: HandleId,
        detect_runnable: bool,
        detect_activatable: bool,
    ) -> Result<()> {
        {
            let mut owner = self.lock_owner();
            owner.owner_id = Some(owner_id);
            owner.surrogate_owner_id = surrogate_owner_id;
            owner.owner_handle = Some(owner_handle);
        }

        let identity = LockOwnerIdentity::new(owner_id, surrogate_owner_id);
        let detection: Option<Box<dyn LeaseTaskHandler>> = if detect_activatable {
            Some(Box::new(DetectActivatableHandler))
        } else if detect_runnable {
            Some(Box::new(DetectRunnableHandler))
        } else {
            None
        };

        let tasks = LeaseTaskSet {
            renewal: self.spawn_task(
                Box::new(RenewLockHandler::new(self.schedule.lease_duration())),
                identity,
                self.schedule.renewal_period,
            ),
            recovery: self.spawn_task(
                Box::new(RecoverLocksHandler),
                identity,
                self.schedule.recovery_period,
            ),
            detection: detection
                .map(|handler| self.spawn_task(handler, identity, self.schedule.detection_period)),
        };

        let detection_task = tasks.detection.as_ref().map(|task| task.name());
        let started = tasks.tasks();
        if let Some(previous) = self.tasks.lock()?.replace(tasks) {
            previous.cancel();
        }

        event!(
            Level::INFO,
            owner_id = %owner_id,
            surrogate_owner_id,
            detection = detection_task,
            "lock owner created"
        );
        for task in started {
            task.reset_timer(true, None);
        }
        Ok(())
    }

    fn spawn_task(
        &self,
        handler: Box<dyn LeaseTaskHandler>,
        owner: LockOwnerIdentity,
        interval: Duration,
    ) -> Arc<PeriodicLeaseTask> {
        PeriodicLeaseTask::new(
            handler,
            owner,
            interval,
            self.schedule.command_timeout,
            self.weak_self.clone(),
            self.executor.clone(),
        )
    }

    /// Invalidates the owner, frees its handle, aborts parked retries and
    /// stops the background tasks.
    ///
    /// A stale `surrogate_owner_id` is ignored, so repeated calls are
    /// harmless. Returns whether this call lost the owner. Pass the guard when
    /// the modification lock is already held.
    pub async fn mark_owner_lost(
        &self,
        surrogate_owner_id: i64,
        held: Option<&ModificationGuard<'_>>,
    ) -> Result<bool> {
        match held {
            Some(_) => self.lose_owner(surrogate_owner_id),
            None => {
                let guard = self.take_modification_lock().await;
                let lost = self.lose_owner(surrogate_owner_id);
                self.return_modification_lock(guard);
                lost
            }
        }
    }

    fn lose_owner(&self, surrogate_owner_id: i64) -> Result<bool> {
        let (owner_id, handle) = {
            let mut owner = self.lock_owner();
            if owner.surrogate_owner_id == NO_SURROGATE_OWNER
                || owner.surrogate_owner_id != surrogate_owner_id
            {
                return Ok(false);
            }
            owner.surrogate_owner_id = NO_SURROGATE_OWNER;
            (owner.owner_id.take(), owner.owner_handle.take())
        };

        if let Some(handle) = handle {
            self.registry.free(handle)?;
        }
        let aborted = self.scheduler.abort_all()?;
        if let Some(tasks) = self.tasks.lock()?.take() {
            tasks.cancel();
        }
        self.owners_lost.fetch_add(1, Ordering::SeqCst);

        event!(
            Level::INFO,
            surrogate_owner_id,
            aborted_retries = aborted,
            "lock owner lost"
        );
        if let Some(owner_id) = owner_id {
            self.publish(InstanceStoreEvent::OwnerLost {
                owner_id,
                surrogate_owner_id,
            });
        }
        Ok(true)
    }

    /// How many owners this manager has lost so far.
    pub fn owners_lost(&self) -> u64 {
        self.owners_lost.load(Ordering::SeqCst)
    }

    /// Live background tasks of the current owner.
    pub fn tasks(&self) -> Vec<Arc<PeriodicLeaseTask>> {
        self.tasks
            .lock()
            .map(|tasks| tasks.as_ref().map(LeaseTaskSet::tasks).unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn publish(&self, store_event: InstanceStoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(store_event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceStoreEvent> {
        self.events.subscribe()
    }
}

impl RetryGate for LeaseOwnershipManager {
    fn accepts_retries(&self) -> bool {
        self.is_valid(self.surrogate_owner_id())
    }
}
