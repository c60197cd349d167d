// ============================================================================
// Lock Contention Retry
// ============================================================================
//
// Lock-sensitive commands that race another owner's instance lock are parked
// in a shared due-time heap and re-issued once their delay elapses, unless the
// caller's timeout or the loss of the lock owner ends them first.
//
// ============================================================================

pub mod orchestrator;
pub mod queue;
pub mod scheduler;
pub mod strategy;

pub use orchestrator::{LockContentionRetryOrchestrator, RetryGate};
pub use queue::{DEFAULT_CAPACITY, RetryPriorityQueue};
pub use scheduler::{PendingRetry, RetryScheduler, RetryWake};
pub use strategy::{
    ConstantDelayStrategy, EXPONENT_LIMIT, ExponentialBackoffStrategy, InstanceLockedRetryPolicy,
    RetryDelayStrategy,
};
