use crate::core::{Result, StoreError};
use crate::transaction::{AmbientTransaction, TransactionState};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Sends the deferred unlock for an instance whose lease is released.
pub trait UnlockIssuer: Send + Sync {
    fn issue_unlock(&self, instance_id: Uuid, version: i64);
}

/// Lease state of the instance a handle checked out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceLeaseBinding {
    pub instance_id: Option<Uuid>,
    pub version: i64,
    pub bound_to_lease: bool,
    pub handle_freed: bool,
    pub safe_to_unlock: bool,
    pub unlock_issued: bool,
}

impl InstanceLeaseBinding {
    /// Marks the unlock as issued when every condition holds.
    fn take_unlock(&mut self) -> Option<(Uuid, i64)> {
        if self.bound_to_lease && self.handle_freed && self.safe_to_unlock && !self.unlock_issued {
            self.unlock_issued = true;
            return self.instance_id.map(|instance_id| (instance_id, self.version));
        }
        None
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    binding: InstanceLeaseBinding,
    // Bumped on every bind so callbacks of an older transaction are ignored.
    generation: u64,
}

/// Issues exactly one unlock once the handle is freed and the transaction
/// that bound the lease (if any) committed, whichever happens last.
pub struct InstanceLeaseTracker {
    state: Arc<Mutex<TrackerState>>,
    issuer: Arc<dyn UnlockIssuer>,
}

impl InstanceLeaseTracker {
    pub fn new(issuer: Arc<dyn UnlockIssuer>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState::default())),
            issuer,
        }
    }

    pub fn binding(&self) -> Result<InstanceLeaseBinding> {
        Ok(self.state.lock()?.binding.clone())
    }

    /// Binds the handle to the lease of `instance_id` at `version`.
    ///
    /// Without a transaction the unlock is allowed right away. Under one it is
    /// allowed on commit; any other outcome drops the binding, since the
    /// store's rollback already released the lock.
    pub fn track_lease(
        &self,
        instance_id: Uuid,
        version: i64,
        transaction: Option<&AmbientTransaction>,
    ) -> Result<()> {
        let generation = {
            let mut state = self.state.lock()?;
            if state.binding.handle_freed {
                return Err(StoreError::Permanent(
                    "cannot bind a lease to a freed handle".to_string(),
                ));
            }
            if state.binding.bound_to_lease && state.binding.instance_id != Some(instance_id) {
                return Err(StoreError::Permanent(format!(
                    "handle is already bound to instance {:?}",
                    state.binding.instance_id
                )));
            }
            state.generation += 1;
            state.binding = InstanceLeaseBinding {
                instance_id: Some(instance_id),
                version,
                bound_to_lease: true,
                handle_freed: false,
                safe_to_unlock: transaction.is_none(),
                unlock_issued: false,
            };
            state.generation
        };

        let Some(transaction) = transaction else {
            return Ok(());
        };
        let state = self.state.clone();
        let issuer = self.issuer.clone();
        transaction.on_completion(move |outcome| {
            let unlock = match state.lock() {
                Ok(mut state) if state.generation == generation => {
                    if outcome == TransactionState::Committed {
                        state.binding.safe_to_unlock = true;
                        state.binding.take_unlock()
                    } else {
                        state.binding.bound_to_lease = false;
                        None
                    }
                }
                _ => None,
            };
            if let Some((instance_id, version)) = unlock {
                issuer.issue_unlock(instance_id, version);
            }
        })
    }

    /// Records that the owning handle was released.
    pub fn handle_freed(&self) -> Result<()> {
        let unlock = {
            let mut state = self.state.lock()?;
            state.binding.handle_freed = true;
            state.binding.take_unlock()
        };
        if let Some((instance_id, version)) = unlock {
            self.issuer.issue_unlock(instance_id, version);
        }
        Ok(())
    }
}
