// ============================================================================
// Ambient Transaction Module
// ============================================================================
//
// Tracks the distributed transaction a caller enlisted the store in, so that
// retry eligibility and deferred unlocks can depend on its presence and outcome.
//
// ============================================================================

pub mod ambient;
pub mod state;

pub use ambient::{AmbientTransaction, CompletionCallback};
pub use crate::core::TransactionId;
pub use state::TransactionState;
