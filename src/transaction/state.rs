// ============================================================================
// Ambient Transaction State
// ============================================================================
//
// A distributed transaction the caller has enlisted the store in. The engine
// never drives it; it only observes how it ends:
//
//   Active ──commit──> Committed
//     │
//     ├──abort──> Aborted
//     └──in doubt──> InDoubt
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is still running
    Active,

    /// Transaction committed
    Committed,

    /// Transaction rolled back
    Aborted,

    /// Outcome unknown to this process
    InDoubt,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
            TransactionState::InDoubt => write!(f, "IN_DOUBT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TransactionState::Active.is_active());
        assert!(TransactionState::Committed.is_terminal());
        assert!(TransactionState::Aborted.is_terminal());
        assert!(TransactionState::InDoubt.is_terminal());
    }
}
