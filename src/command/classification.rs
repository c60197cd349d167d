use crate::core::{FailurePhase, StoreError};
use std::collections::HashMap;

/// Where a transient store error code may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransientErrorRule {
    pub code: i32,
    pub retry_on_open: bool,
    pub retry_on_execute: bool,
    pub retry_in_transaction: bool,
}

impl TransientErrorRule {
    const fn new(
        code: i32,
        retry_on_open: bool,
        retry_on_execute: bool,
        retry_in_transaction: bool,
    ) -> Self {
        Self {
            code,
            retry_on_open,
            retry_on_execute,
            retry_in_transaction,
        }
    }

    pub fn allows(&self, phase: FailurePhase) -> bool {
        match phase {
            FailurePhase::Open => self.retry_on_open,
            FailurePhase::Execute => self.retry_on_execute,
        }
    }
}

/// Transient codes reported by the relational store.
pub static TRANSIENT_ERROR_CODES: &[TransientErrorRule] = &[
    // timeout expired
    TransientErrorRule::new(-2, true, true, false),
    // network / instance not reachable
    TransientErrorRule::new(20, true, false, false),
    TransientErrorRule::new(53, true, false, false),
    TransientErrorRule::new(64, true, false, false),
    TransientErrorRule::new(121, true, false, false),
    TransientErrorRule::new(233, true, false, false),
    // deadlock victim, lock request timeout
    TransientErrorRule::new(1205, false, true, true),
    TransientErrorRule::new(1222, false, true, true),
    // socket level failures
    TransientErrorRule::new(10053, true, true, false),
    TransientErrorRule::new(10054, true, true, false),
    TransientErrorRule::new(10060, true, true, false),
    TransientErrorRule::new(10061, true, false, false),
    TransientErrorRule::new(11001, true, false, false),
    // service busy, failover, throttling
    TransientErrorRule::new(40143, true, true, false),
    TransientErrorRule::new(40197, true, true, false),
    TransientErrorRule::new(40501, true, true, false),
    TransientErrorRule::new(40540, true, true, false),
    TransientErrorRule::new(40613, true, true, false),
    TransientErrorRule::new(49918, true, true, false),
    TransientErrorRule::new(49919, true, true, false),
    TransientErrorRule::new(49920, true, true, false),
];

/// Lookup table deciding whether a failed attempt may be re-issued.
#[derive(Debug, Clone)]
pub struct ErrorClassification {
    rules: HashMap<i32, TransientErrorRule>,
    retry_any_under_transaction: bool,
}

impl ErrorClassification {
    pub fn standard() -> Self {
        Self::with_rules(TRANSIENT_ERROR_CODES.iter().copied())
    }

    pub fn with_rules(rules: impl IntoIterator<Item = TransientErrorRule>) -> Self {
        Self {
            rules: rules.into_iter().map(|rule| (rule.code, rule)).collect(),
            retry_any_under_transaction: false,
        }
    }

    /// Lets every phase-eligible code retry while a transaction is ambient,
    /// whether or not its rule grants in-transaction retries.
    pub fn retry_any_under_transaction(mut self, enabled: bool) -> Self {
        self.retry_any_under_transaction = enabled;
        self
    }

    pub fn rule(&self, code: i32) -> Option<&TransientErrorRule> {
        self.rules.get(&code)
    }

    pub fn is_retryable(&self, err: &StoreError, phase: FailurePhase, in_transaction: bool) -> bool {
        let StoreError::TransientInfra { code, .. } = err else {
            return false;
        };
        let Some(rule) = self.rules.get(code) else {
            return false;
        };
        if !rule.allows(phase) {
            return false;
        }
        !in_transaction || rule.retry_in_transaction || self.retry_any_under_transaction
    }
}

impl Default for ErrorClassification {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient(code: i32, phase: FailurePhase) -> StoreError {
        StoreError::TransientInfra {
            code,
            phase,
            message: "test".to_string(),
        }
    }

    #[test]
    fn test_phase_filtering() {
        let table = ErrorClassification::standard();
        assert!(table.is_retryable(&transient(53, FailurePhase::Open), FailurePhase::Open, false));
        assert!(!table.is_retryable(
            &transient(53, FailurePhase::Execute),
            FailurePhase::Execute,
            false
        ));
        assert!(table.is_retryable(
            &transient(1205, FailurePhase::Execute),
            FailurePhase::Execute,
            false
        ));
    }

    #[test]
    fn test_transaction_sensitivity() {
        let table = ErrorClassification::standard();
        let throttled = transient(40501, FailurePhase::Execute);
        assert!(table.is_retryable(&throttled, FailurePhase::Execute, false));
        assert!(!table.is_retryable(&throttled, FailurePhase::Execute, true));

        let deadlock = transient(1205, FailurePhase::Execute);
        assert!(table.is_retryable(&deadlock, FailurePhase::Execute, true));

        let widened = ErrorClassification::standard().retry_any_under_transaction(true);
        assert!(widened.is_retryable(&throttled, FailurePhase::Execute, true));
        assert!(!widened.is_retryable(
            &transient(53, FailurePhase::Execute),
            FailurePhase::Execute,
            true
        ));
    }

    #[test]
    fn test_unknown_and_non_transient_errors() {
        let table = ErrorClassification::standard();
        assert!(!table.is_retryable(&transient(99999, FailurePhase::Open), FailurePhase::Open, false));
        assert!(!table.is_retryable(
            &StoreError::Permanent("bad".into()),
            FailurePhase::Execute,
            false
        ));
        assert!(!table.is_retryable(&StoreError::Fatal("oom".into()), FailurePhase::Open, false));
    }

    #[test]
    fn test_custom_rules_replace_table() {
        let table = ErrorClassification::with_rules([TransientErrorRule::new(7, false, true, false)]);
        assert!(table.rule(1205).is_none());
        assert!(table.is_retryable(&transient(7, FailurePhase::Execute), FailurePhase::Execute, false));
    }
}
