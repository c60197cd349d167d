use crate::core::Result;
use std::collections::HashSet;
use std::future::Future;
use tokio::sync::Mutex;

/// Remembers one-time registrations so they are sent to the store once.
///
/// The lock is held while a registration runs, so concurrent callers for the
/// same key wait for the first one instead of registering twice. Share one
/// cache between stores by wrapping it in an `Arc`.
#[derive(Debug, Default)]
pub struct RegistrationCache {
    registered: Mutex<HashSet<String>>,
}

impl RegistrationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `register` unless `key` is already registered. Returns whether it
    /// ran. A failed registration is not remembered.
    pub async fn register_once<F>(&self, key: &str, register: F) -> Result<bool>
    where
        F: Future<Output = Result<()>>,
    {
        let mut registered = self.registered.lock().await;
        if registered.contains(key) {
            return Ok(false);
        }
        register.await?;
        registered.insert(key.to_string());
        Ok(true)
    }

    pub async fn is_registered(&self, key: &str) -> bool {
        self.registered.lock().await.contains(key)
    }

    pub async fn forget(&self, key: &str) -> bool {
        self.registered.lock().await.remove(key)
    }
}
