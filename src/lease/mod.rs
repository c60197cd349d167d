// ============================================================================
// Lease Ownership
// ============================================================================
//
// One lock owner per store. Its lease is kept alive by background tasks,
// abandoned locks are recovered and runnable work is detected while the owner
// is valid. Losing the owner stops the tasks and aborts parked lock retries.
// Checked-out instances are unlocked once their handle is released.
//
// ============================================================================

pub mod event;
pub mod manager;
pub mod registry;
pub mod task;
pub mod tracker;

pub use event::InstanceStoreEvent;
pub use manager::{LeaseOwnershipManager, LeaseSchedule, ModificationGuard};
pub use registry::{HandleKind, HandleRegistry};
pub use task::{
    DetectActivatableHandler, DetectRunnableHandler, LeaseTaskHandler, LeaseTaskState,
    PeriodicLeaseTask, RecoverLocksHandler, RenewLockHandler, TaskErrorAction,
};
pub use tracker::{InstanceLeaseBinding, InstanceLeaseTracker, UnlockIssuer};
