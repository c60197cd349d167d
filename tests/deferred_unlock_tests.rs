/// Deferred unlock tests
///
/// An instance lock is released only after the handle is freed and the
/// transaction that loaded it committed.
/// Run with: cargo test --test deferred_unlock_tests
use durable_instance_store::{
    AmbientTransaction, InMemoryStoreConnector, InstanceStore, LockOwnerOptions, StoreConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn setup() -> (InMemoryStoreConnector, InstanceStore, Uuid) {
    let connector = InMemoryStoreConnector::new();
    let instance_id = Uuid::new_v4();
    connector.seed_instance(instance_id, false).unwrap();
    let store = InstanceStore::new(Arc::new(connector.clone()), StoreConfig::default()).unwrap();
    store
        .create_lock_owner(LockOwnerOptions::new(), TIMEOUT)
        .await
        .unwrap();
    (connector, store, instance_id)
}

async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_unlock_on_drop_without_transaction() {
    let (connector, store, instance_id) = setup().await;
    let handle = store.open_instance_handle().unwrap();
    store
        .load_instance(&handle, instance_id, None, TIMEOUT)
        .await
        .unwrap();
    assert!(connector.instance(instance_id).unwrap().locked_by.is_some());

    drop(handle);
    settle().await;

    assert_eq!(connector.unlocked(), vec![(instance_id, 1)]);
    assert_eq!(connector.instance(instance_id).unwrap().locked_by, None);
}

#[tokio::test(start_paused = true)]
async fn test_unlock_waits_for_commit() {
    let (connector, store, instance_id) = setup().await;
    let transaction = AmbientTransaction::new();
    let handle = store.open_instance_handle().unwrap();
    store
        .load_instance(&handle, instance_id, Some(&transaction), TIMEOUT)
        .await
        .unwrap();

    assert!(handle.free().unwrap());
    settle().await;
    assert!(connector.unlocked().is_empty());

    transaction.commit().unwrap();
    settle().await;
    assert_eq!(connector.unlocked(), vec![(instance_id, 1)]);
}

#[tokio::test(start_paused = true)]
async fn test_commit_before_free_unlocks_on_free() {
    let (connector, store, instance_id) = setup().await;
    let transaction = AmbientTransaction::new();
    let handle = store.open_instance_handle().unwrap();
    store
        .load_instance(&handle, instance_id, Some(&transaction), TIMEOUT)
        .await
        .unwrap();

    transaction.commit().unwrap();
    settle().await;
    assert!(connector.unlocked().is_empty());
    assert!(handle.binding().unwrap().safe_to_unlock);

    drop(handle);
    settle().await;
    assert_eq!(connector.unlocked(), vec![(instance_id, 1)]);
}

#[tokio::test(start_paused = true)]
async fn test_commit_on_plain_thread_unlocks() {
    let (connector, store, instance_id) = setup().await;
    let transaction = AmbientTransaction::new();
    let handle = store.open_instance_handle().unwrap();
    store
        .load_instance(&handle, instance_id, Some(&transaction), TIMEOUT)
        .await
        .unwrap();
    assert!(handle.free().unwrap());

    let committing = transaction.clone();
    std::thread::spawn(move || committing.commit().unwrap())
        .join()
        .unwrap();
    settle().await;

    assert_eq!(connector.unlocked(), vec![(instance_id, 1)]);
    assert_eq!(connector.instance(instance_id).unwrap().locked_by, None);
}

#[tokio::test(start_paused = true)]
async fn test_handle_dropped_on_plain_thread_unlocks() {
    let (connector, store, instance_id) = setup().await;
    let handle = store.open_instance_handle().unwrap();
    store
        .load_instance(&handle, instance_id, None, TIMEOUT)
        .await
        .unwrap();

    std::thread::spawn(move || drop(handle)).join().unwrap();
    settle().await;

    assert_eq!(connector.unlocked(), vec![(instance_id, 1)]);
}

#[tokio::test(start_paused = true)]
async fn test_aborted_transaction_never_unlocks() {
    let (connector, store, instance_id) = setup().await;
    let transaction = AmbientTransaction::new();
    let handle = store.open_instance_handle().unwrap();
    store
        .load_instance(&handle, instance_id, Some(&transaction), TIMEOUT)
        .await
        .unwrap();

    transaction.abort().unwrap();
    assert!(!handle.binding().unwrap().bound_to_lease);
    drop(handle);
    settle().await;

    assert!(connector.unlocked().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unlock_uses_saved_version() {
    let (connector, store, instance_id) = setup().await;
    let handle = store.open_instance_handle().unwrap();
    let outcome = store
        .load_instance(&handle, instance_id, None, TIMEOUT)
        .await
        .unwrap();
    let version = outcome.instance_version.unwrap();

    let saved = store
        .save_instance(&handle, instance_id, version, true, None, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(saved, version + 1);

    drop(handle);
    settle().await;
    assert_eq!(connector.unlocked(), vec![(instance_id, saved)]);
    let snapshot = connector.instance(instance_id).unwrap();
    assert_eq!(snapshot.locked_by, None);
    assert!(snapshot.runnable);
}

#[tokio::test(start_paused = true)]
async fn test_runnable_instance_loaded_and_released() {
    let (connector, store, _) = setup().await;
    let runnable = Uuid::new_v4();
    connector.seed_instance(runnable, true).unwrap();

    let handle = store.open_instance_handle().unwrap();
    let loaded = store.try_load_runnable(&handle, None, TIMEOUT).await.unwrap();
    assert_eq!(loaded, Some((runnable, 1)));

    let other = store.open_instance_handle().unwrap();
    assert_eq!(store.try_load_runnable(&other, None, TIMEOUT).await.unwrap(), None);

    drop(handle);
    settle().await;
    assert_eq!(connector.unlocked(), vec![(runnable, 1)]);
}

#[tokio::test(start_paused = true)]
async fn test_no_unlock_after_owner_deleted() {
    let (connector, store, instance_id) = setup().await;
    let handle = store.open_instance_handle().unwrap();
    store
        .load_instance(&handle, instance_id, None, TIMEOUT)
        .await
        .unwrap();

    store.delete_lock_owner(TIMEOUT).await.unwrap();
    drop(handle);
    settle().await;

    assert!(connector.unlocked().is_empty());
    // Deleting the owner released its locks in the store.
    assert_eq!(connector.instance(instance_id).unwrap().locked_by, None);
}
