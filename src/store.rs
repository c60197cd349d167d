use crate::command::{
    CommandKind, CommandOutcome, ResilientCommandExecutor, StoreCommand, StoreConnector, params,
};
use crate::config::StoreConfig;
use crate::core::{HandleId, LockOwnerIdentity, NO_SURROGATE_OWNER, Result, StoreError};
use crate::lease::{
    HandleRegistry, InstanceLeaseBinding, InstanceLeaseTracker, InstanceStoreEvent,
    LeaseOwnershipManager, LeaseSchedule, UnlockIssuer,
};
use crate::registration::RegistrationCache;
use crate::retry::{LockContentionRetryOrchestrator, RetryScheduler};
use crate::transaction::AmbientTransaction;
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{Level, event};
use uuid::Uuid;

/// How a new lock owner should behave.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockOwnerOptions {
    pub detect_runnable: bool,
    pub detect_activatable: bool,
    /// Registered with the store once per registration cache.
    pub host_type: Option<String>,
}

impl LockOwnerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detect_runnable(mut self, enabled: bool) -> Self {
        self.detect_runnable = enabled;
        self
    }

    pub fn detect_activatable(mut self, enabled: bool) -> Self {
        self.detect_activatable = enabled;
        self
    }

    pub fn host_type(mut self, host_type: impl Into<String>) -> Self {
        self.host_type = Some(host_type.into());
        self
    }
}

/// Client side of a shared durable instance store.
///
/// Owns one lock owner at a time, runs commands under it and releases
/// checked-out instances when their handles go away.
pub struct InstanceStore {
    config: StoreConfig,
    executor: Arc<ResilientCommandExecutor>,
    scheduler: Arc<RetryScheduler>,
    registry: Arc<HandleRegistry>,
    registrations: Arc<RegistrationCache>,
    manager: Arc<LeaseOwnershipManager>,
    orchestrator: Option<LockContentionRetryOrchestrator>,
    runtime: Handle,
}

impl InstanceStore {
    /// Must be called from within a tokio runtime; deferred unlocks are
    /// spawned on it even when they are triggered from other threads.
    pub fn new(connector: Arc<dyn StoreConnector>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|err| {
            StoreError::Fatal(format!("instance store needs a tokio runtime: {}", err))
        })?;

        let executor = Arc::new(ResilientCommandExecutor::from_config(connector, &config));
        let scheduler = RetryScheduler::new();
        let registry = Arc::new(HandleRegistry::new());
        let manager = LeaseOwnershipManager::new(
            executor.clone(),
            scheduler.clone(),
            registry.clone(),
            LeaseSchedule::from_config(&config),
        );
        let orchestrator = config
            .instance_locked_retry
            .strategy(&config)
            .map(|strategy| {
                LockContentionRetryOrchestrator::new(
                    executor.clone(),
                    scheduler.clone(),
                    strategy,
                    manager.clone(),
                )
            });

        Ok(Self {
            config,
            executor,
            scheduler,
            registry,
            registrations: Arc::new(RegistrationCache::new()),
            manager,
            orchestrator,
            runtime,
        })
    }

    /// Shares one-time registrations with other stores.
    pub fn with_registration_cache(mut self, registrations: Arc<RegistrationCache>) -> Self {
        self.registrations = registrations;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn default_timeout(&self) -> Duration {
        self.config.default_command_timeout_duration()
    }

    pub fn owner(&self) -> Option<LockOwnerIdentity> {
        self.manager.owner()
    }

    pub fn lease_manager(&self) -> &Arc<LeaseOwnershipManager> {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<InstanceStoreEvent> {
        self.manager.subscribe()
    }

    pub fn pending_retries(&self) -> usize {
        self.scheduler.pending()
    }

    /// Aborts every parked lock retry; their callers get the contention error.
    pub fn abort_pending_retries(&self) -> Result<usize> {
        self.scheduler.abort_all()
    }

    /// Creates the lock owner of this store and starts its lease tasks.
    ///
    /// # Examples
    ///
    /// ```
    /// use durable_instance_store::{InMemoryStoreConnector, InstanceStore, LockOwnerOptions, StoreConfig};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// # tokio_test::block_on(async {
    /// let store = InstanceStore::new(Arc::new(InMemoryStoreConnector::new()), StoreConfig::default()).unwrap();
    /// let owner = store
    ///     .create_lock_owner(LockOwnerOptions::new().detect_runnable(true), Duration::from_secs(5))
    ///     .await
    ///     .unwrap();
    /// assert!(owner.is_assigned());
    /// assert!(store.delete_lock_owner(Duration::from_secs(5)).await.unwrap());
    /// # });
    /// ```
    pub async fn create_lock_owner(
        &self,
        options: LockOwnerOptions,
        timeout: Duration,
    ) -> Result<LockOwnerIdentity> {
        let deadline = Instant::now() + timeout;
        let guard = self.manager.take_modification_lock().await;
        if let Some(existing) = self.manager.owner() {
            return Err(StoreError::Permanent(format!(
                "lock owner {} already exists",
                existing.owner_id
            )));
        }

        if let Some(host_type) = options.host_type.as_deref() {
            let command = StoreCommand::new(CommandKind::RegisterHostType)
                .with_parameter(params::HOST_TYPE, host_type);
            let executor = &self.executor;
            self.registrations
                .register_once(host_type, async move {
                    executor
                        .execute(command, None, remaining(deadline))
                        .await
                        .map(|_| ())
                })
                .await?;
        }

        let owner_id = Uuid::new_v4();
        let lease = self.manager.schedule().lease_duration();
        let command = StoreCommand::new(CommandKind::CreateLockOwner)
            .with_parameter(params::OWNER_ID, owner_id.to_string())
            .with_parameter(params::LOCK_TIMEOUT_MS, lease.as_millis() as u64)
            .with_parameter(params::DETECT_RUNNABLE, options.detect_runnable)
            .with_parameter(params::DETECT_ACTIVATABLE, options.detect_activatable);
        let outcome = self
            .executor
            .execute(command, None, remaining(deadline))
            .await?;
        let surrogate_owner_id = outcome
            .surrogate_owner_id
            .filter(|id| *id != NO_SURROGATE_OWNER)
            .ok_or_else(|| {
                StoreError::Permanent("CreateLockOwner returned no surrogate owner id".to_string())
            })?;

        let handle = self.registry.register_owner(owner_id)?;
        self.manager.mark_owner_created(
            &guard,
            owner_id,
            surrogate_owner_id,
            handle,
            options.detect_runnable,
            options.detect_activatable,
        )?;
        self.manager.return_modification_lock(guard);

        Ok(LockOwnerIdentity::new(owner_id, surrogate_owner_id))
    }

    /// Deletes the lock owner. The owner is treated as lost even when the
    /// store call fails. Returns false if there was no owner.
    pub async fn delete_lock_owner(&self, timeout: Duration) -> Result<bool> {
        let guard = self.manager.take_modification_lock().await;
        let surrogate_owner_id = self.manager.surrogate_owner_id();
        if surrogate_owner_id == NO_SURROGATE_OWNER {
            return Ok(false);
        }

        let command = StoreCommand::new(CommandKind::DeleteLockOwner)
            .with_parameter(params::SURROGATE_OWNER_ID, surrogate_owner_id);
        let result = self.executor.execute(command, None, timeout).await;
        self.manager
            .mark_owner_lost(surrogate_owner_id, Some(&guard))
            .await?;
        self.manager.return_modification_lock(guard);

        result.map(|_| true)
    }

    /// Runs `command` under the current lock owner.
    ///
    /// Lock-sensitive commands wait out contention when a lock retry policy is
    /// configured. A store report that the owner is gone loses the owner.
    pub async fn try_command(
        &self,
        mut command: StoreCommand,
        transaction: Option<&AmbientTransaction>,
        timeout: Duration,
    ) -> Result<CommandOutcome> {
        let surrogate_owner_id = {
            let guard = self.manager.take_modification_lock().await;
            let surrogate_owner_id = self.manager.surrogate_owner_id();
            self.manager.return_modification_lock(guard);
            surrogate_owner_id
        };

        if surrogate_owner_id != NO_SURROGATE_OWNER {
            command.set_parameter(params::SURROGATE_OWNER_ID, surrogate_owner_id);
        } else if command.kind.requires_owner() {
            return Err(StoreError::OwnerLost {
                surrogate_owner_id: NO_SURROGATE_OWNER,
            });
        }

        let result = match &self.orchestrator {
            Some(orchestrator) if command.is_lock_sensitive() => {
                orchestrator.try_command(command, transaction, timeout).await
            }
            _ => self.executor.execute(command, transaction, timeout).await,
        };

        if let Err(err) = &result {
            if err.indicates_owner_lost() && surrogate_owner_id != NO_SURROGATE_OWNER {
                if let Err(mark_err) = self.manager.mark_owner_lost(surrogate_owner_id, None).await {
                    event!(Level::ERROR, error = %mark_err, "could not mark lock owner lost");
                }
            }
        }
        result
    }

    /// Asks the store whether any lock owner with a live lease exists, this
    /// store's or another host's.
    pub async fn owners_exist_in_store(&self, timeout: Duration) -> Result<bool> {
        let outcome = self
            .executor
            .execute(StoreCommand::new(CommandKind::QueryOwnerExistence), None, timeout)
            .await?;
        outcome.owners_exist.ok_or_else(|| {
            StoreError::Permanent("QueryOwnerExistence returned no answer".to_string())
        })
    }

    /// Takes over an abandoned instance lock at exactly `lock_version`.
    pub async fn try_reclaim_lock(
        &self,
        instance_id: Uuid,
        lock_version: i64,
        transaction: Option<&AmbientTransaction>,
        timeout: Duration,
    ) -> Result<CommandOutcome> {
        let command = StoreCommand::new(CommandKind::ReclaimLock)
            .for_instance(instance_id)
            .with_parameter(params::LOCK_VERSION, lock_version);
        self.try_command(command, transaction, timeout).await
    }

    pub fn open_instance_handle(&self) -> Result<InstanceHandle> {
        let id = self.registry.register_instance()?;
        let issuer = Arc::new(StoreUnlockIssuer {
            executor: self.executor.clone(),
            manager: Arc::downgrade(&self.manager),
            timeout: self.default_timeout(),
            runtime: self.runtime.clone(),
        });
        Ok(InstanceHandle {
            id,
            registry: self.registry.clone(),
            tracker: InstanceLeaseTracker::new(issuer),
            freed: AtomicBool::new(false),
        })
    }

    /// Loads and locks an instance for `handle`, reclaiming the lock when the
    /// store reports it abandoned.
    pub async fn load_instance(
        &self,
        handle: &InstanceHandle,
        instance_id: Uuid,
        transaction: Option<&AmbientTransaction>,
        timeout: Duration,
    ) -> Result<CommandOutcome> {
        let deadline = Instant::now() + timeout;
        let command = StoreCommand::new(CommandKind::LoadInstance).for_instance(instance_id);
        let outcome = match self.try_command(command, transaction, timeout).await {
            Ok(outcome) => outcome,
            Err(err) => match err.reclaimable_lock_version() {
                Some(lock_version) => {
                    event!(
                        Level::INFO,
                        instance_id = %instance_id,
                        lock_version,
                        "reclaiming abandoned instance lock"
                    );
                    self.try_reclaim_lock(instance_id, lock_version, transaction, remaining(deadline))
                        .await?
                }
                None => return Err(err),
            },
        };

        let version = outcome.instance_version.ok_or_else(|| {
            StoreError::Permanent(format!("load of {} returned no version", instance_id))
        })?;
        handle.track_lease(instance_id, version, transaction)?;
        Ok(outcome)
    }

    /// Locks the next runnable instance for `handle`, if there is one.
    pub async fn try_load_runnable(
        &self,
        handle: &InstanceHandle,
        transaction: Option<&AmbientTransaction>,
        timeout: Duration,
    ) -> Result<Option<(Uuid, i64)>> {
        let command = StoreCommand::new(CommandKind::TryLoadRunnableInstance);
        let outcome = self.try_command(command, transaction, timeout).await?;
        match (outcome.instance_id, outcome.instance_version) {
            (Some(instance_id), Some(version)) => {
                handle.track_lease(instance_id, version, transaction)?;
                Ok(Some((instance_id, version)))
            }
            _ => Ok(None),
        }
    }

    /// Saves a locked instance at `expected_version` and returns its new
    /// version. The handle keeps the lease at the new version.
    pub async fn save_instance(
        &self,
        handle: &InstanceHandle,
        instance_id: Uuid,
        expected_version: i64,
        runnable: bool,
        transaction: Option<&AmbientTransaction>,
        timeout: Duration,
    ) -> Result<i64> {
        let command = StoreCommand::new(CommandKind::SaveInstance)
            .for_instance(instance_id)
            .with_parameter(params::VERSION, expected_version)
            .with_parameter(params::RUNNABLE, runnable);
        let outcome = self.try_command(command, transaction, timeout).await?;
        let version = outcome.instance_version.ok_or_else(|| {
            StoreError::Permanent(format!("save of {} returned no version", instance_id))
        })?;
        handle.track_lease(instance_id, version, transaction)?;
        Ok(version)
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

struct StoreUnlockIssuer {
    executor: Arc<ResilientCommandExecutor>,
    manager: Weak<LeaseOwnershipManager>,
    timeout: Duration,
    runtime: Handle,
}

impl UnlockIssuer for StoreUnlockIssuer {
    fn issue_unlock(&self, instance_id: Uuid, version: i64) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let surrogate_owner_id = manager.surrogate_owner_id();
        if surrogate_owner_id == NO_SURROGATE_OWNER {
            event!(
                Level::DEBUG,
                instance_id = %instance_id,
                "no lock owner, leaving instance lock to recovery"
            );
            return;
        }
        let command = StoreCommand::new(CommandKind::UnlockInstance)
            .for_instance(instance_id)
            .with_parameter(params::SURROGATE_OWNER_ID, surrogate_owner_id)
            .with_parameter(params::VERSION, version);
        let executor = self.executor.clone();
        let timeout = self.timeout;
        self.runtime.spawn(async move {
            if let Err(err) = executor.execute(command, None, timeout).await {
                warn!("unlock of instance {} failed: {}", instance_id, err);
            }
        });
    }
}

/// A caller's handle on checked-out instances.
///
/// Freeing or dropping it releases the instance lease once the transaction
/// that bound it has committed.
pub struct InstanceHandle {
    id: HandleId,
    registry: Arc<HandleRegistry>,
    tracker: InstanceLeaseTracker,
    freed: AtomicBool,
}

impl InstanceHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn binding(&self) -> Result<InstanceLeaseBinding> {
        self.tracker.binding()
    }

    pub fn track_lease(
        &self,
        instance_id: Uuid,
        version: i64,
        transaction: Option<&AmbientTransaction>,
    ) -> Result<()> {
        self.tracker.track_lease(instance_id, version, transaction)
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::SeqCst)
    }

    /// Releases the handle. Returns false if it was already released.
    pub fn free(&self) -> Result<bool> {
        if self.freed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.registry.free(self.id)?;
        self.tracker.handle_freed()?;
        Ok(true)
    }
}

impl Drop for InstanceHandle {
    fn drop(&mut self) {
        if let Err(err) = self.free() {
            warn!("failed to free instance handle {}: {}", self.id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStoreConnector;

    fn store(connector: &InMemoryStoreConnector) -> InstanceStore {
        InstanceStore::new(Arc::new(connector.clone()), StoreConfig::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_commands_need_an_owner() {
        let connector = InMemoryStoreConnector::new();
        let store = store(&connector);

        let command = StoreCommand::new(CommandKind::LoadInstance).for_instance(Uuid::new_v4());
        let err = store
            .try_command(command, None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OwnerLost { surrogate_owner_id: NO_SURROGATE_OWNER }));
        assert_eq!(connector.call_count(CommandKind::LoadInstance), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_owner_rejected() {
        let connector = InMemoryStoreConnector::new();
        let store = store(&connector);
        store
            .create_lock_owner(LockOwnerOptions::new(), Duration::from_secs(5))
            .await
            .unwrap();

        let err = store
            .create_lock_owner(LockOwnerOptions::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Permanent(_)));
        assert_eq!(connector.owners().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_type_registered_once_per_cache() {
        let connector = InMemoryStoreConnector::new();
        let cache = Arc::new(RegistrationCache::new());
        let options = LockOwnerOptions::new().host_type("order-service");

        for _ in 0..2 {
            let store = store(&connector).with_registration_cache(cache.clone());
            store
                .create_lock_owner(options.clone(), Duration::from_secs(5))
                .await
                .unwrap();
            store.delete_lock_owner(Duration::from_secs(5)).await.unwrap();
        }

        assert_eq!(connector.call_count(CommandKind::RegisterHostType), 1);
        assert_eq!(connector.call_count(CommandKind::CreateLockOwner), 2);
        assert!(cache.is_registered("order-service").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_free_twice_is_harmless() {
        let connector = InMemoryStoreConnector::new();
        let store = store(&connector);
        let handle = store.open_instance_handle().unwrap();
        assert!(store.registry().is_live(handle.id()));

        assert!(handle.free().unwrap());
        assert!(!handle.free().unwrap());
        assert!(!store.registry().is_live(handle.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_existence_is_asked_of_the_store() {
        let connector = InMemoryStoreConnector::new();
        let first = store(&connector);
        let second = store(&connector);
        let timeout = Duration::from_secs(5);
        assert!(!second.owners_exist_in_store(timeout).await.unwrap());

        first
            .create_lock_owner(LockOwnerOptions::new(), timeout)
            .await
            .unwrap();
        assert!(second.owners_exist_in_store(timeout).await.unwrap());
        assert_eq!(first.registry().live_count(), 1);

        first.delete_lock_owner(timeout).await.unwrap();
        assert!(!second.owners_exist_in_store(timeout).await.unwrap());
        assert_eq!(first.registry().live_count(), 0);
        assert_eq!(connector.call_count(CommandKind::QueryOwnerExistence), 3);
    }

    #[test]
    fn test_store_needs_a_runtime() {
        let connector = InMemoryStoreConnector::new();
        let result = InstanceStore::new(Arc::new(connector), StoreConfig::default());
        assert!(matches!(result.err(), Some(StoreError::Fatal(_))));
    }
}
