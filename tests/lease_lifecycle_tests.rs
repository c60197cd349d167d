/// Lock owner lifecycle tests
///
/// Owner creation, background lease tasks, detection events and owner loss
/// against the in-memory store.
/// Run with: cargo test --test lease_lifecycle_tests
use durable_instance_store::{
    CommandKind, InMemoryStoreConnector, InstanceStore, InstanceStoreEvent, LockOwnerOptions,
    NO_SURROGATE_OWNER, StoreConfig, StoreError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

const TIMEOUT: Duration = Duration::from_secs(5);

fn new_store(connector: &InMemoryStoreConnector) -> InstanceStore {
    InstanceStore::new(Arc::new(connector.clone()), StoreConfig::default()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_create_owner_starts_three_tasks() {
    let connector = InMemoryStoreConnector::new();
    let store = new_store(&connector);

    let owner = store
        .create_lock_owner(
            LockOwnerOptions::new()
                .detect_runnable(true)
                .detect_activatable(true),
            TIMEOUT,
        )
        .await
        .unwrap();
    assert!(owner.is_assigned());
    assert_eq!(store.owner(), Some(owner));

    sleep(Duration::from_millis(10)).await;

    let tasks = store.lease_manager().tasks();
    let names: Vec<&str> = tasks.iter().map(|task| task.name()).collect();
    assert_eq!(names.len(), 3);
    assert!(names.contains(&"detect-activatable"));
    assert!(!names.contains(&"detect-runnable"));

    assert_eq!(connector.call_count(CommandKind::ExtendLock), 1);
    assert_eq!(connector.call_count(CommandKind::RecoverInstanceLocks), 1);
    assert_eq!(connector.call_count(CommandKind::DetectActivatableInstances), 1);
    assert_eq!(connector.call_count(CommandKind::DetectRunnableInstances), 0);
}

#[tokio::test(start_paused = true)]
async fn test_owner_without_detection_runs_two_tasks() {
    let connector = InMemoryStoreConnector::new();
    let store = new_store(&connector);
    store
        .create_lock_owner(LockOwnerOptions::new(), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(store.lease_manager().tasks().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_detection_publishes_runnable_event() {
    let connector = InMemoryStoreConnector::new();
    connector.seed_instance(Uuid::new_v4(), true).unwrap();
    connector.seed_instance(Uuid::new_v4(), false).unwrap();
    let store = new_store(&connector);
    let mut events = store.subscribe_events();

    let owner = store
        .create_lock_owner(LockOwnerOptions::new().detect_runnable(true), TIMEOUT)
        .await
        .unwrap();

    match events.recv().await.unwrap() {
        InstanceStoreEvent::HasRunnableInstance {
            owner_id, count, ..
        } => {
            assert_eq!(owner_id, owner.owner_id);
            assert_eq!(count, 1);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_renewal_keeps_lease_alive() {
    let connector = InMemoryStoreConnector::new();
    let config = StoreConfig::default().host_lock_renewal_period(Duration::from_secs(10));
    let store = InstanceStore::new(Arc::new(connector.clone()), config).unwrap();
    store
        .create_lock_owner(LockOwnerOptions::new(), TIMEOUT)
        .await
        .unwrap();

    sleep(Duration::from_secs(95)).await;

    // Immediate renewal plus one every 10s.
    assert_eq!(connector.call_count(CommandKind::ExtendLock), 10);
    assert!(connector.owners()[0].lease_live);
    assert!(store.owner().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_failed_renewal_loses_owner() {
    let connector = InMemoryStoreConnector::new();
    connector
        .fail_next_execute(
            Some(CommandKind::ExtendLock),
            StoreError::Permanent("lease row missing".into()),
        )
        .unwrap();
    let store = new_store(&connector);
    let mut events = store.subscribe_events();

    let owner = store
        .create_lock_owner(LockOwnerOptions::new(), TIMEOUT)
        .await
        .unwrap();

    let lost = events.recv().await.unwrap();
    assert_eq!(
        lost,
        InstanceStoreEvent::OwnerLost {
            owner_id: owner.owner_id,
            surrogate_owner_id: owner.surrogate_owner_id,
        }
    );
    assert!(store.owner().is_none());
    assert!(store.lease_manager().tasks().is_empty());
    assert_eq!(store.lease_manager().owners_lost(), 1);

    let handle = store.open_instance_handle().unwrap();
    let err = store
        .load_instance(&handle, Uuid::new_v4(), None, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::OwnerLost {
            surrogate_owner_id: NO_SURROGATE_OWNER
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_fatal_recovery_error_stops_only_recovery() {
    let connector = InMemoryStoreConnector::new();
    connector
        .fail_next_execute(
            Some(CommandKind::RecoverInstanceLocks),
            StoreError::Fatal("store process crashed".into()),
        )
        .unwrap();
    let config = StoreConfig::default().host_lock_renewal_period(Duration::from_secs(10));
    let store = InstanceStore::new(Arc::new(connector.clone()), config).unwrap();
    store
        .create_lock_owner(LockOwnerOptions::new(), TIMEOUT)
        .await
        .unwrap();

    sleep(Duration::from_secs(35)).await;

    assert_eq!(connector.call_count(CommandKind::RecoverInstanceLocks), 1);
    assert_eq!(connector.call_count(CommandKind::ExtendLock), 4);
    assert!(store.owner().is_some());
    let recovery = store
        .lease_manager()
        .tasks()
        .into_iter()
        .find(|task| task.name() == "lock-recovery")
        .unwrap();
    assert!(recovery.state().cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_expired_lease_is_noticed_on_renewal() {
    let connector = InMemoryStoreConnector::new();
    let store = new_store(&connector);
    let owner = store
        .create_lock_owner(LockOwnerOptions::new(), TIMEOUT)
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;

    connector.expire_owner(owner.surrogate_owner_id).unwrap();
    sleep(Duration::from_secs(31)).await;

    assert!(store.owner().is_none());
    assert_eq!(store.lease_manager().owners_lost(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_store_reported_owner_loss_invalidates_owner() {
    let connector = InMemoryStoreConnector::new();
    let instance_id = Uuid::new_v4();
    connector.seed_instance(instance_id, false).unwrap();
    let store = new_store(&connector);
    let owner = store
        .create_lock_owner(LockOwnerOptions::new(), TIMEOUT)
        .await
        .unwrap();
    connector.expire_owner(owner.surrogate_owner_id).unwrap();

    let handle = store.open_instance_handle().unwrap();
    let err = store
        .load_instance(&handle, instance_id, None, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::OwnerLost { surrogate_owner_id } if surrogate_owner_id == owner.surrogate_owner_id
    ));
    assert!(store.owner().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_mark_owner_lost_is_idempotent() {
    let connector = InMemoryStoreConnector::new();
    let store = new_store(&connector);
    let owner = store
        .create_lock_owner(LockOwnerOptions::new(), TIMEOUT)
        .await
        .unwrap();
    let manager = store.lease_manager();

    assert!(
        manager
            .mark_owner_lost(owner.surrogate_owner_id, None)
            .await
            .unwrap()
    );
    assert!(
        !manager
            .mark_owner_lost(owner.surrogate_owner_id, None)
            .await
            .unwrap()
    );
    assert!(!manager.mark_owner_lost(NO_SURROGATE_OWNER, None).await.unwrap());
    assert_eq!(manager.owners_lost(), 1);
    assert!(!manager.is_valid(owner.surrogate_owner_id));
}

#[tokio::test(start_paused = true)]
async fn test_delete_owner_stops_tasks() {
    let connector = InMemoryStoreConnector::new();
    let store = new_store(&connector);
    store
        .create_lock_owner(LockOwnerOptions::new().detect_runnable(true), TIMEOUT)
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;

    assert!(store.delete_lock_owner(TIMEOUT).await.unwrap());
    assert!(!store.delete_lock_owner(TIMEOUT).await.unwrap());
    assert!(connector.owners().is_empty());

    let renewals = connector.call_count(CommandKind::ExtendLock);
    let detections = connector.call_count(CommandKind::DetectRunnableInstances);
    sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.call_count(CommandKind::ExtendLock), renewals);
    assert_eq!(
        connector.call_count(CommandKind::DetectRunnableInstances),
        detections
    );
}

#[tokio::test(start_paused = true)]
async fn test_new_owner_after_delete() {
    let connector = InMemoryStoreConnector::new();
    let store = new_store(&connector);
    let first = store
        .create_lock_owner(LockOwnerOptions::new(), TIMEOUT)
        .await
        .unwrap();
    store.delete_lock_owner(TIMEOUT).await.unwrap();

    let second = store
        .create_lock_owner(LockOwnerOptions::new(), TIMEOUT)
        .await
        .unwrap();
    assert_ne!(first.surrogate_owner_id, second.surrogate_owner_id);

    // A late loss report for the first owner leaves the second alone.
    assert!(
        !store
            .lease_manager()
            .mark_owner_lost(first.surrogate_owner_id, None)
            .await
            .unwrap()
    );
    assert_eq!(store.owner(), Some(second));
}
