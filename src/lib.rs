// ============================================================================
// Durable Instance Store
// ============================================================================
//
// Client-side engine for a shared, lease-based instance store: lock owner
// lifecycle, background lease tasks, lock contention retries and resilient
// execution of store commands.
//
// ============================================================================

pub mod command;
pub mod config;
pub mod core;
pub mod lease;
pub mod memory;
pub mod registration;
pub mod retry;
pub mod store;
pub mod timer;
pub mod transaction;

pub use command::{
    CommandKind, CommandOutcome, ErrorClassification, ExecutorSettings, ResilientCommandExecutor,
    StoreCommand, StoreConnector, StoreSession,
};
pub use config::StoreConfig;
pub use core::{FailurePhase, HandleId, LockOwnerIdentity, NO_SURROGATE_OWNER, Result, StoreError};
pub use lease::{
    InstanceLeaseTracker, InstanceStoreEvent, LeaseOwnershipManager, PeriodicLeaseTask,
};
pub use memory::InMemoryStoreConnector;
pub use registration::RegistrationCache;
pub use retry::{
    ConstantDelayStrategy, ExponentialBackoffStrategy, InstanceLockedRetryPolicy,
    LockContentionRetryOrchestrator, RetryDelayStrategy, RetryPriorityQueue, RetryScheduler,
};
pub use store::{InstanceHandle, InstanceStore, LockOwnerOptions};
pub use transaction::{AmbientTransaction, TransactionState};
