pub mod error;
pub mod types;

pub use error::{FailurePhase, Result, StoreError};
pub use types::{HandleId, LockOwnerIdentity, NO_SURROGATE_OWNER, TransactionId};
