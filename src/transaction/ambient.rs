use super::{TransactionId, TransactionState};
use crate::core::Result;
use std::sync::{Arc, Mutex};

pub type CompletionCallback = Box<dyn FnOnce(TransactionState) + Send>;

struct AmbientInner {
    id: TransactionId,
    state: Mutex<TransactionState>,
    callbacks: Mutex<Vec<CompletionCallback>>,
}

/// Handle to the distributed transaction a command runs under.
///
/// Cloning shares the same transaction. It completes exactly once; completion
/// callbacks run on the completing thread, outside any internal lock.
#[derive(Clone)]
pub struct AmbientTransaction {
    inner: Arc<AmbientInner>,
}

impl AmbientTransaction {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AmbientInner {
                id: TransactionId::new(),
                state: Mutex::new(TransactionState::Active),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    pub fn state(&self) -> Result<TransactionState> {
        Ok(*self.inner.state.lock()?)
    }

    /// Registers `callback` for the transaction outcome. Runs immediately when
    /// the transaction already completed.
    pub fn on_completion<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(TransactionState) + Send + 'static,
    {
        let state = self.inner.state.lock()?;
        if state.is_active() {
            self.inner.callbacks.lock()?.push(Box::new(callback));
            return Ok(());
        }
        let outcome = *state;
        drop(state);
        callback(outcome);
        Ok(())
    }

    pub fn commit(&self) -> Result<bool> {
        self.complete(TransactionState::Committed)
    }

    pub fn abort(&self) -> Result<bool> {
        self.complete(TransactionState::Aborted)
    }

    pub fn mark_in_doubt(&self) -> Result<bool> {
        self.complete(TransactionState::InDoubt)
    }

    /// Returns false if the transaction had already completed.
    fn complete(&self, outcome: TransactionState) -> Result<bool> {
        let callbacks = {
            let mut state = self.inner.state.lock()?;
            if !state.is_active() {
                return Ok(false);
            }
            *state = outcome;
            std::mem::take(&mut *self.inner.callbacks.lock()?)
        };

        for callback in callbacks {
            callback(outcome);
        }
        Ok(true)
    }
}

impl Default for AmbientTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AmbientTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmbientTransaction")
            .field("id", &self.inner.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_callbacks_run_once_on_commit() {
        let txn = AmbientTransaction::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = calls.clone();
        txn.on_completion(move |state| {
            assert_eq!(state, TransactionState::Committed);
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(txn.commit().unwrap());
        assert!(!txn.commit().unwrap());
        assert!(!txn.abort().unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(txn.state().unwrap(), TransactionState::Committed);
    }

    #[test]
    fn test_late_callback_runs_immediately() {
        let txn = AmbientTransaction::new();
        txn.abort().unwrap();

        let observed = Arc::new(Mutex::new(None));
        let slot = observed.clone();
        txn.on_completion(move |state| {
            *slot.lock().unwrap() = Some(state);
        })
        .unwrap();

        assert_eq!(*observed.lock().unwrap(), Some(TransactionState::Aborted));
    }
}
