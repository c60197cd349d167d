use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Surrogate id meaning "no lock owner".
pub const NO_SURROGATE_OWNER: i64 = -1;

/// Identity of the lock owner this process currently holds.
///
/// `surrogate_owner_id` is assigned by the store when the owner is created and
/// is the fast-path validity token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwnerIdentity {
    pub owner_id: Uuid,
    pub surrogate_owner_id: i64,
}

impl LockOwnerIdentity {
    pub fn new(owner_id: Uuid, surrogate_owner_id: i64) -> Self {
        Self {
            owner_id,
            surrogate_owner_id,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.surrogate_owner_id != NO_SURROGATE_OWNER
    }
}

/// Declares a process-unique, monotonically increasing `u64` id type.
macro_rules! sequential_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            pub fn new() -> Self {
                static NEXT: AtomicU64 = AtomicU64::new(1);
                $name(NEXT.fetch_add(1, Ordering::SeqCst))
            }

            pub fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "_{}"), self.0)
            }
        }
    };
}

sequential_id!(
    /// Identifier of an owner or instance handle tracked by the handle registry.
    HandleId,
    "handle"
);

sequential_id!(
    /// Identifier of an ambient transaction.
    TransactionId,
    "txn"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_increase_per_type() {
        let first = TransactionId::new();
        let second = TransactionId::new();
        assert!(second.as_u64() > first.as_u64());
        assert_eq!(format!("{}", TransactionId(7)), "txn_7");
        assert_eq!(format!("{}", HandleId(3)), "handle_3");
    }

    #[test]
    fn test_unassigned_owner() {
        let owner = LockOwnerIdentity::new(Uuid::nil(), NO_SURROGATE_OWNER);
        assert!(!owner.is_assigned());
        assert!(LockOwnerIdentity::new(Uuid::nil(), 4).is_assigned());
    }
}
