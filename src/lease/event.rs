use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Notifications published by the lease manager to store subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum InstanceStoreEvent {
    HasRunnableInstance {
        owner_id: Uuid,
        count: u64,
        detected_at: DateTime<Utc>,
    },
    HasActivatableInstance {
        owner_id: Uuid,
        count: u64,
        detected_at: DateTime<Utc>,
    },
    OwnerLost {
        owner_id: Uuid,
        surrogate_owner_id: i64,
    },
}

impl InstanceStoreEvent {
    pub fn owner_id(&self) -> Uuid {
        match self {
            InstanceStoreEvent::HasRunnableInstance { owner_id, .. }
            | InstanceStoreEvent::HasActivatableInstance { owner_id, .. }
            | InstanceStoreEvent::OwnerLost { owner_id, .. } => *owner_id,
        }
    }
}
