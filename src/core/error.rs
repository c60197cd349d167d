use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Phase of a remote command attempt in which a failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePhase {
    /// Opening the connection to the store.
    Open,
    /// Executing the command on an open connection.
    Execute,
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePhase::Open => write!(f, "open"),
            FailurePhase::Execute => write!(f, "execute"),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Another lock owner holds the instance lock.
    ///
    /// `lock_version` is reported when the contending lock looks abandoned and
    /// may be reclaimed at exactly that version.
    #[error("Instance {instance_id} is locked by owner {owner_id:?}")]
    Contention {
        instance_id: Uuid,
        owner_id: Option<Uuid>,
        lock_version: Option<i64>,
    },

    #[error("Transient store error {code} during {phase}: {message}")]
    TransientInfra {
        code: i32,
        phase: FailurePhase,
        message: String,
    },

    #[error("Stale version for instance {instance_id}: expected {expected}, found {actual}")]
    StaleVersion {
        instance_id: Uuid,
        expected: i64,
        actual: i64,
    },

    #[error("Permanent store error: {0}")]
    Permanent(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Retry queue is empty")]
    EmptyQueue,

    #[error("Lock owner {surrogate_owner_id} is no longer valid")]
    OwnerLost { surrogate_owner_id: i64 },

    #[error("Pending retry aborted because the lock owner was lost")]
    RetryAborted,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl StoreError {
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::Contention { .. })
    }

    /// Fatal errors bypass every retry path.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Fatal(_))
    }

    /// Version at which an abandoned lock can be taken over, if the store reported one.
    pub fn reclaimable_lock_version(&self) -> Option<i64> {
        match self {
            StoreError::Contention { lock_version, .. } => *lock_version,
            _ => None,
        }
    }

    /// Errors that mean the current lock owner can no longer be trusted.
    pub fn indicates_owner_lost(&self) -> bool {
        matches!(self, StoreError::OwnerLost { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
