// ============================================================================
// Remote Store Commands
// ============================================================================
//
// The engine never builds SQL or parses rows. A command is an opaque procedure
// name plus named parameters; the protocol layer behind `StoreConnector`
// turns it into a wire call and fills a `CommandOutcome`.
//
// ============================================================================

pub mod classification;
pub mod executor;

pub use classification::{ErrorClassification, TRANSIENT_ERROR_CODES, TransientErrorRule};
pub use executor::{ExecutorSettings, ResilientCommandExecutor};

use crate::core::Result;
use crate::transaction::AmbientTransaction;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Parameter names shared by the engine and the protocol layer.
pub mod params {
    pub const SURROGATE_OWNER_ID: &str = "surrogateLockOwnerId";
    pub const OWNER_ID: &str = "lockOwnerId";
    pub const LOCK_TIMEOUT_MS: &str = "lockTimeoutMs";
    pub const VERSION: &str = "version";
    pub const LOCK_VERSION: &str = "lockVersion";
    pub const HOST_TYPE: &str = "hostType";
    pub const DETECT_RUNNABLE: &str = "enqueueCommand";
    pub const DETECT_ACTIVATABLE: &str = "activatable";
    pub const RUNNABLE: &str = "isReadyToRun";
    pub const UNLOCK: &str = "unlockInstance";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    CreateLockOwner,
    DeleteLockOwner,
    ExtendLock,
    RecoverInstanceLocks,
    DetectRunnableInstances,
    DetectActivatableInstances,
    LoadInstance,
    TryLoadRunnableInstance,
    SaveInstance,
    UnlockInstance,
    ReclaimLock,
    QueryOwnerExistence,
    RegisterHostType,
    Custom,
}

impl CommandKind {
    /// Commands that target one instance and can race another owner's lock.
    pub fn is_lock_sensitive(&self) -> bool {
        matches!(
            self,
            CommandKind::LoadInstance | CommandKind::SaveInstance | CommandKind::ReclaimLock
        )
    }

    /// Commands that only make sense under a valid lock owner.
    pub fn requires_owner(&self) -> bool {
        matches!(
            self,
            CommandKind::ExtendLock
                | CommandKind::RecoverInstanceLocks
                | CommandKind::DetectRunnableInstances
                | CommandKind::DetectActivatableInstances
                | CommandKind::LoadInstance
                | CommandKind::TryLoadRunnableInstance
                | CommandKind::SaveInstance
                | CommandKind::UnlockInstance
                | CommandKind::ReclaimLock
        )
    }

    pub fn procedure_name(&self) -> &'static str {
        match self {
            CommandKind::CreateLockOwner => "CreateLockOwner",
            CommandKind::DeleteLockOwner => "DeleteLockOwner",
            CommandKind::ExtendLock => "ExtendLock",
            CommandKind::RecoverInstanceLocks => "RecoverInstanceLocks",
            CommandKind::DetectRunnableInstances => "DetectRunnableInstances",
            CommandKind::DetectActivatableInstances => "GetActivatableWorkflowsActivationParameters",
            CommandKind::LoadInstance => "LoadInstance",
            CommandKind::TryLoadRunnableInstance => "TryLoadRunnableInstance",
            CommandKind::SaveInstance => "SaveInstance",
            CommandKind::UnlockInstance => "UnlockInstance",
            CommandKind::ReclaimLock => "ReclaimLock",
            CommandKind::QueryOwnerExistence => "QueryOwnerExistence",
            CommandKind::RegisterHostType => "InsertDefinitionIdentity",
            CommandKind::Custom => "Custom",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.procedure_name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandParameter {
    pub name: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreCommand {
    pub kind: CommandKind,
    pub procedure: String,
    pub instance_id: Option<Uuid>,
    pub parameters: Vec<CommandParameter>,
    /// How many times this command has been re-issued after a transient failure.
    pub retry_count: u32,
}

impl StoreCommand {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            procedure: kind.procedure_name().to_string(),
            instance_id: None,
            parameters: Vec::new(),
            retry_count: 0,
        }
    }

    /// A caller-defined procedure that the engine treats as `CommandKind::Custom`.
    pub fn custom(procedure: &str) -> Self {
        Self {
            procedure: procedure.to_string(),
            ..Self::new(CommandKind::Custom)
        }
    }

    pub fn for_instance(mut self, instance_id: Uuid) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn with_parameter(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.push(CommandParameter {
            name: name.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&serde_json::Value> {
        self.parameters
            .iter()
            .find(|param| param.name == name)
            .map(|param| &param.value)
    }

    pub fn parameter_i64(&self, name: &str) -> Option<i64> {
        self.parameter(name).and_then(|value| value.as_i64())
    }

    pub fn parameter_bool(&self, name: &str) -> Option<bool> {
        self.parameter(name).and_then(|value| value.as_bool())
    }

    pub fn parameter_str(&self, name: &str) -> Option<&str> {
        self.parameter(name).and_then(|value| value.as_str())
    }

    /// Sets `name`, replacing an existing value.
    pub fn set_parameter(&mut self, name: &str, value: impl Into<serde_json::Value>) {
        let value = value.into();
        match self.parameters.iter_mut().find(|param| param.name == name) {
            Some(param) => param.value = value,
            None => self.parameters.push(CommandParameter {
                name: name.to_string(),
                value,
            }),
        }
    }

    pub fn is_lock_sensitive(&self) -> bool {
        self.kind.is_lock_sensitive() && self.instance_id.is_some()
    }

    /// Fresh copy for a transient retry: same procedure and target, parameters
    /// re-attached, no execution state carried over.
    pub fn clone_for_retry(&self) -> Self {
        let mut retry = Self {
            kind: self.kind,
            procedure: self.procedure.clone(),
            instance_id: self.instance_id,
            parameters: Vec::with_capacity(self.parameters.len()),
            retry_count: self.retry_count + 1,
        };
        retry.parameters.extend(self.parameters.iter().cloned());
        retry
    }
}

/// Parsed result of one command. Fields a command does not produce stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub surrogate_owner_id: Option<i64>,
    pub instance_id: Option<Uuid>,
    pub instance_version: Option<i64>,
    pub next_detection_in: Option<Duration>,
    pub owners_exist: Option<bool>,
    pub rows_affected: u64,
}

/// Opens connections to the remote store.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn StoreSession>>;
}

/// One open connection. Never reused after a failure.
#[async_trait]
pub trait StoreSession: Send {
    async fn execute(
        &mut self,
        command: &StoreCommand,
        transaction: Option<&AmbientTransaction>,
    ) -> Result<CommandOutcome>;

    async fn close(self: Box<Self>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_sensitivity_requires_instance() {
        let load = StoreCommand::new(CommandKind::LoadInstance);
        assert!(!load.is_lock_sensitive());
        assert!(load.for_instance(Uuid::new_v4()).is_lock_sensitive());

        let renew = StoreCommand::new(CommandKind::ExtendLock).for_instance(Uuid::new_v4());
        assert!(!renew.is_lock_sensitive());
    }

    #[test]
    fn test_clone_for_retry_reattaches_parameters() {
        let command = StoreCommand::new(CommandKind::SaveInstance)
            .for_instance(Uuid::new_v4())
            .with_parameter("version", 3)
            .with_parameter("complete", true);

        let retry = command.clone_for_retry();
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.procedure, command.procedure);
        assert_eq!(retry.instance_id, command.instance_id);
        assert_eq!(retry.parameter_i64("version"), Some(3));
        assert_eq!(retry.parameters, command.parameters);
        assert_eq!(retry.clone_for_retry().retry_count, 2);
    }

    #[test]
    fn test_custom_command() {
        let command = StoreCommand::custom("PurgeCompletedInstances");
        assert_eq!(command.kind, CommandKind::Custom);
        assert_eq!(command.procedure, "PurgeCompletedInstances");
    }
}
