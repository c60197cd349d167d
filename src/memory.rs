use crate::command::{CommandKind, CommandOutcome, StoreCommand, StoreConnector, StoreSession, params};
use crate::core::{NO_SURROGATE_OWNER, Result, StoreError};
use crate::transaction::AmbientTransaction;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

const DEFAULT_LEASE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct OwnerRecord {
    owner_id: Uuid,
    lease_expires_at: Instant,
    created_at: DateTime<Utc>,
}

impl OwnerRecord {
    fn is_live(&self, now: Instant) -> bool {
        self.lease_expires_at > now
    }
}

#[derive(Debug, Clone)]
struct InstanceRecord {
    version: i64,
    lock_owner: Option<i64>,
    lock_version: i64,
    runnable: bool,
}

/// Point-in-time view of one stored instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSnapshot {
    pub version: i64,
    pub locked_by: Option<i64>,
    pub lock_version: i64,
    pub runnable: bool,
}

/// Point-in-time view of one lock owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerSnapshot {
    pub owner_id: Uuid,
    pub surrogate_owner_id: i64,
    pub created_at: DateTime<Utc>,
    pub lease_live: bool,
}

#[derive(Default)]
struct MemoryStoreState {
    next_surrogate_owner_id: i64,
    owners: HashMap<i64, OwnerRecord>,
    instances: HashMap<Uuid, InstanceRecord>,
    host_types: HashSet<String>,
    open_faults: VecDeque<StoreError>,
    execute_faults: VecDeque<(Option<CommandKind>, StoreError)>,
    calls: HashMap<CommandKind, u64>,
    unlocked: Vec<(Uuid, i64)>,
    open_sessions: usize,
}

/// Process-local instance store.
///
/// Clones share the same state, so several hosts can contend for the same
/// instances. Lease expiry follows tokio time. Faults can be queued to
/// exercise the retry paths.
#[derive(Clone, Default)]
pub struct InMemoryStoreConnector {
    state: Arc<Mutex<MemoryStoreState>>,
}

impl InMemoryStoreConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next connection open with `err`.
    pub fn fail_next_open(&self, err: StoreError) -> Result<()> {
        self.state.lock()?.open_faults.push_back(err);
        Ok(())
    }

    /// Fails the next execution of `kind` (any kind when `None`) with `err`.
    pub fn fail_next_execute(&self, kind: Option<CommandKind>, err: StoreError) -> Result<()> {
        self.state.lock()?.execute_faults.push_back((kind, err));
        Ok(())
    }

    /// Number of executions of `kind` that reached the store, failed or not.
    pub fn call_count(&self, kind: CommandKind) -> u64 {
        self.state
            .lock()
            .map(|state| state.calls.get(&kind).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().map(|state| state.open_sessions).unwrap_or(0)
    }

    /// Adds an unlocked instance at version 1.
    pub fn seed_instance(&self, instance_id: Uuid, runnable: bool) -> Result<()> {
        self.state.lock()?.instances.insert(
            instance_id,
            InstanceRecord {
                version: 1,
                lock_owner: None,
                lock_version: 0,
                runnable,
            },
        );
        Ok(())
    }

    pub fn instance(&self, instance_id: Uuid) -> Option<InstanceSnapshot> {
        let state = self.state.lock().ok()?;
        state.instances.get(&instance_id).map(|record| InstanceSnapshot {
            version: record.version,
            locked_by: record.lock_owner,
            lock_version: record.lock_version,
            runnable: record.runnable,
        })
    }

    pub fn owners(&self) -> Vec<OwnerSnapshot> {
        let now = Instant::now();
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let mut owners: Vec<OwnerSnapshot> = state
            .owners
            .iter()
            .map(|(surrogate_owner_id, record)| OwnerSnapshot {
                owner_id: record.owner_id,
                surrogate_owner_id: *surrogate_owner_id,
                created_at: record.created_at,
                lease_live: record.is_live(now),
            })
            .collect();
        owners.sort_by_key(|owner| owner.surrogate_owner_id);
        owners
    }

    /// Ends the lease of an owner as if it had stopped renewing.
    pub fn expire_owner(&self, surrogate_owner_id: i64) -> Result<bool> {
        let mut state = self.state.lock()?;
        match state.owners.get_mut(&surrogate_owner_id) {
            Some(record) => {
                record.lease_expires_at = Instant::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Unlock commands that released a lock, in order.
    pub fn unlocked(&self) -> Vec<(Uuid, i64)> {
        self.state
            .lock()
            .map(|state| state.unlocked.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StoreConnector for InMemoryStoreConnector {
    async fn open(&self) -> Result<Box<dyn StoreSession>> {
        let mut state = self.state.lock()?;
        if let Some(err) = state.open_faults.pop_front() {
            return Err(err);
        }
        state.open_sessions += 1;
        Ok(Box::new(MemorySession {
            state: self.state.clone(),
        }))
    }
}

struct MemorySession {
    state: Arc<Mutex<MemoryStoreState>>,
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn execute(
        &mut self,
        command: &StoreCommand,
        _transaction: Option<&AmbientTransaction>,
    ) -> Result<CommandOutcome> {
        let mut state = self.state.lock()?;
        *state.calls.entry(command.kind).or_insert(0) += 1;

        let fault = state
            .execute_faults
            .iter()
            .position(|(kind, _)| kind.is_none_or(|kind| kind == command.kind));
        if let Some(index) = fault {
            if let Some((_, err)) = state.execute_faults.remove(index) {
                return Err(err);
            }
        }

        state.apply(command, Instant::now())
    }

    async fn close(self: Box<Self>) {
        if let Ok(mut state) = self.state.lock() {
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
    }
}

impl MemoryStoreState {
    fn apply(&mut self, command: &StoreCommand, now: Instant) -> Result<CommandOutcome> {
        match command.kind {
            CommandKind::CreateLockOwner => self.create_owner(command, now),
            CommandKind::DeleteLockOwner => self.delete_owner(command),
            CommandKind::ExtendLock => self.extend_lock(command, now),
            CommandKind::RecoverInstanceLocks => Ok(self.recover_locks(now)),
            CommandKind::DetectRunnableInstances | CommandKind::DetectActivatableInstances => {
                self.live_owner(command, now)?;
                Ok(self.detect(now))
            }
            CommandKind::LoadInstance => self.load(command, now),
            CommandKind::TryLoadRunnableInstance => self.load_runnable(command, now),
            CommandKind::SaveInstance => self.save(command, now),
            CommandKind::UnlockInstance => self.unlock(command),
            CommandKind::ReclaimLock => self.reclaim(command, now),
            CommandKind::QueryOwnerExistence => Ok(CommandOutcome {
                owners_exist: Some(self.owners.values().any(|owner| owner.is_live(now))),
                ..CommandOutcome::default()
            }),
            CommandKind::RegisterHostType => {
                let host_type = command
                    .parameter_str(params::HOST_TYPE)
                    .ok_or_else(|| StoreError::Permanent("hostType is required".to_string()))?;
                let inserted = self.host_types.insert(host_type.to_string());
                Ok(CommandOutcome {
                    rows_affected: inserted as u64,
                    ..CommandOutcome::default()
                })
            }
            CommandKind::Custom => Ok(CommandOutcome::default()),
        }
    }

    fn create_owner(&mut self, command: &StoreCommand, now: Instant) -> Result<CommandOutcome> {
        let owner_id = command
            .parameter_str(params::OWNER_ID)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| StoreError::Permanent("lockOwnerId is required".to_string()))?;
        let lease = lease_duration(command);

        self.next_surrogate_owner_id += 1;
        let surrogate_owner_id = self.next_surrogate_owner_id;
        self.owners.insert(
            surrogate_owner_id,
            OwnerRecord {
                owner_id,
                lease_expires_at: now + lease,
                created_at: Utc::now(),
            },
        );
        Ok(CommandOutcome {
            surrogate_owner_id: Some(surrogate_owner_id),
            rows_affected: 1,
            ..CommandOutcome::default()
        })
    }

    fn delete_owner(&mut self, command: &StoreCommand) -> Result<CommandOutcome> {
        let surrogate_owner_id = surrogate(command);
        let removed = self.owners.remove(&surrogate_owner_id).is_some();
        self.release_locks_of(|owner| owner == surrogate_owner_id);
        Ok(CommandOutcome {
            rows_affected: removed as u64,
            ..CommandOutcome::default()
        })
    }

    fn extend_lock(&mut self, command: &StoreCommand, now: Instant) -> Result<CommandOutcome> {
        let surrogate_owner_id = surrogate(command);
        let lease = lease_duration(command);
        match self.owners.get_mut(&surrogate_owner_id) {
            Some(owner) if owner.is_live(now) => {
                owner.lease_expires_at = now + lease;
                Ok(CommandOutcome {
                    rows_affected: 1,
                    ..CommandOutcome::default()
                })
            }
            _ => Err(StoreError::OwnerLost { surrogate_owner_id }),
        }
    }

    /// Drops expired owners and frees the instance locks they held.
    fn recover_locks(&mut self, now: Instant) -> CommandOutcome {
        let expired: HashSet<i64> = self
            .owners
            .iter()
            .filter(|(_, owner)| !owner.is_live(now))
            .map(|(id, _)| *id)
            .collect();
        self.owners.retain(|id, _| !expired.contains(id));
        let released = self.release_locks_of(|owner| expired.contains(&owner));
        CommandOutcome {
            rows_affected: released,
            ..CommandOutcome::default()
        }
    }

    fn detect(&self, now: Instant) -> CommandOutcome {
        let ready = self
            .instances
            .values()
            .filter(|record| record.runnable && !self.is_held(record, now))
            .count();
        CommandOutcome {
            rows_affected: ready as u64,
            ..CommandOutcome::default()
        }
    }

    fn load(&mut self, command: &StoreCommand, now: Instant) -> Result<CommandOutcome> {
        let caller = self.live_owner(command, now)?;
        let instance_id = target(command)?;
        self.lock_instance(instance_id, caller, now)
    }

    fn load_runnable(&mut self, command: &StoreCommand, now: Instant) -> Result<CommandOutcome> {
        let caller = self.live_owner(command, now)?;
        let candidate = self
            .instances
            .iter()
            .filter(|(_, record)| record.runnable && !self.is_held(record, now))
            .map(|(id, _)| *id)
            .min();
        match candidate {
            Some(instance_id) => self.lock_instance(instance_id, caller, now),
            None => Ok(CommandOutcome::default()),
        }
    }

    fn save(&mut self, command: &StoreCommand, now: Instant) -> Result<CommandOutcome> {
        let caller = self.live_owner(command, now)?;
        let instance_id = target(command)?;
        let expected = command.parameter_i64(params::VERSION).unwrap_or(0);

        if !self.instances.contains_key(&instance_id) {
            if expected != 0 {
                return Err(StoreError::StaleVersion {
                    instance_id,
                    expected,
                    actual: 0,
                });
            }
            self.instances.insert(
                instance_id,
                InstanceRecord {
                    version: 0,
                    lock_owner: Some(caller),
                    lock_version: 1,
                    runnable: false,
                },
            );
        }

        let holder = self.instances.get(&instance_id).and_then(|r| r.lock_owner);
        if holder != Some(caller) {
            return Err(self.contention_or_stale(instance_id, expected, now));
        }

        let Some(record) = self.instances.get_mut(&instance_id) else {
            return Err(StoreError::Permanent(format!("instance {} vanished", instance_id)));
        };
        if record.version != expected {
            return Err(StoreError::StaleVersion {
                instance_id,
                expected,
                actual: record.version,
            });
        }

        record.version += 1;
        if let Some(runnable) = command.parameter_bool(params::RUNNABLE) {
            record.runnable = runnable;
        }
        if command.parameter_bool(params::UNLOCK).unwrap_or(false) {
            record.lock_owner = None;
        }
        Ok(CommandOutcome {
            instance_id: Some(instance_id),
            instance_version: Some(record.version),
            rows_affected: 1,
            ..CommandOutcome::default()
        })
    }

    fn unlock(&mut self, command: &StoreCommand) -> Result<CommandOutcome> {
        let caller = surrogate(command);
        let instance_id = target(command)?;
        let version = command.parameter_i64(params::VERSION);

        let released = match self.instances.get_mut(&instance_id) {
            Some(record)
                if record.lock_owner == Some(caller)
                    && version.is_none_or(|v| v == record.version) =>
            {
                record.lock_owner = None;
                true
            }
            _ => false,
        };
        if released {
            self.unlocked.push((instance_id, version.unwrap_or_default()));
        }
        Ok(CommandOutcome {
            instance_id: Some(instance_id),
            rows_affected: released as u64,
            ..CommandOutcome::default()
        })
    }

    fn reclaim(&mut self, command: &StoreCommand, now: Instant) -> Result<CommandOutcome> {
        let caller = self.live_owner(command, now)?;
        let instance_id = target(command)?;
        let lock_version = command
            .parameter_i64(params::LOCK_VERSION)
            .ok_or_else(|| StoreError::Permanent("lockVersion is required".to_string()))?;

        let Some(record) = self.instances.get(&instance_id) else {
            return Err(not_found(instance_id));
        };
        if record.lock_version != lock_version || self.is_held(record, now) {
            return Err(self.contention_or_stale(instance_id, 0, now));
        }

        let Some(record) = self.instances.get_mut(&instance_id) else {
            return Err(not_found(instance_id));
        };
        record.lock_owner = Some(caller);
        record.lock_version += 1;
        Ok(CommandOutcome {
            instance_id: Some(instance_id),
            instance_version: Some(record.version),
            rows_affected: 1,
            ..CommandOutcome::default()
        })
    }

    fn lock_instance(
        &mut self,
        instance_id: Uuid,
        caller: i64,
        now: Instant,
    ) -> Result<CommandOutcome> {
        let record = self
            .instances
            .get(&instance_id)
            .ok_or_else(|| not_found(instance_id))?;
        if record.lock_owner.is_some_and(|holder| holder != caller) {
            return Err(self.contention_or_stale(instance_id, record.version, now));
        }

        let Some(record) = self.instances.get_mut(&instance_id) else {
            return Err(not_found(instance_id));
        };
        if record.lock_owner != Some(caller) {
            record.lock_owner = Some(caller);
            record.lock_version += 1;
        }
        Ok(CommandOutcome {
            instance_id: Some(instance_id),
            instance_version: Some(record.version),
            rows_affected: 1,
            ..CommandOutcome::default()
        })
    }

    /// Contention against the current holder, reclaimable when the holder's
    /// lease is gone. Unheld instances report a stale version instead.
    fn contention_or_stale(&self, instance_id: Uuid, expected: i64, now: Instant) -> StoreError {
        let Some(record) = self.instances.get(&instance_id) else {
            return not_found(instance_id);
        };
        let Some(holder) = record.lock_owner else {
            return StoreError::StaleVersion {
                instance_id,
                expected,
                actual: record.version,
            };
        };
        let owner = self.owners.get(&holder);
        let abandoned = owner.is_none_or(|owner| !owner.is_live(now));
        StoreError::Contention {
            instance_id,
            owner_id: owner.map(|owner| owner.owner_id),
            lock_version: abandoned.then_some(record.lock_version),
        }
    }

    fn is_held(&self, record: &InstanceRecord, now: Instant) -> bool {
        record.lock_owner.is_some_and(|holder| {
            self.owners
                .get(&holder)
                .is_some_and(|owner| owner.is_live(now))
        })
    }

    fn live_owner(&self, command: &StoreCommand, now: Instant) -> Result<i64> {
        let surrogate_owner_id = surrogate(command);
        match self.owners.get(&surrogate_owner_id) {
            Some(owner) if owner.is_live(now) => Ok(surrogate_owner_id),
            _ => Err(StoreError::OwnerLost { surrogate_owner_id }),
        }
    }

    fn release_locks_of<F>(&mut self, mut released_owner: F) -> u64
    where
        F: FnMut(i64) -> bool,
    {
        let mut released = 0;
        for record in self.instances.values_mut() {
            if record.lock_owner.is_some_and(&mut released_owner) {
                record.lock_owner = None;
                released += 1;
            }
        }
        released
    }
}

fn surrogate(command: &StoreCommand) -> i64 {
    command
        .parameter_i64(params::SURROGATE_OWNER_ID)
        .unwrap_or(NO_SURROGATE_OWNER)
}

fn lease_duration(command: &StoreCommand) -> Duration {
    command
        .parameter_i64(params::LOCK_TIMEOUT_MS)
        .and_then(|ms| u64::try_from(ms).ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_LEASE)
}

fn target(command: &StoreCommand) -> Result<Uuid> {
    command.instance_id.ok_or_else(|| {
        StoreError::Permanent(format!("{} requires an instance id", command.procedure))
    })
}

fn not_found(instance_id: Uuid) -> StoreError {
    StoreError::Permanent(format!("instance {} not found", instance_id))
}
