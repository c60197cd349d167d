use crate::core::{HandleId, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Handle that created the lock owner with the given id.
    Owner(Uuid),
    /// Handle that checks instances out.
    Instance,
}

/// Live handles of one store, keyed by id.
///
/// The lease manager refers to the handle that created its owner by id and
/// resolves it here instead of holding the handle itself.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    handles: Mutex<HashMap<HandleId, HandleKind>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_owner(&self, owner_id: Uuid) -> Result<HandleId> {
        self.register(HandleKind::Owner(owner_id))
    }

    pub fn register_instance(&self) -> Result<HandleId> {
        self.register(HandleKind::Instance)
    }

    fn register(&self, kind: HandleKind) -> Result<HandleId> {
        let id = HandleId::new();
        self.handles.lock()?.insert(id, kind);
        Ok(id)
    }

    /// Releases a handle. Returns false if it was already freed.
    pub fn free(&self, id: HandleId) -> Result<bool> {
        Ok(self.handles.lock()?.remove(&id).is_some())
    }

    fn kind(&self, id: HandleId) -> Option<HandleKind> {
        self.handles
            .lock()
            .ok()
            .and_then(|handles| handles.get(&id).copied())
    }

    pub fn is_live(&self, id: HandleId) -> bool {
        self.kind(id).is_some()
    }

    /// Whether any owner record is still backed by a live handle.
    pub fn owners_exist(&self) -> bool {
        self.handles
            .lock()
            .map(|handles| {
                handles
                    .values()
                    .any(|kind| matches!(kind, HandleKind::Owner(_)))
            })
            .unwrap_or(false)
    }

    /// Handles not freed yet, owner handle included.
    pub fn live_count(&self) -> usize {
        self.handles.lock().map(|handles| handles.len()).unwrap_or(0)
    }
}
