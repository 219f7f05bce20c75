//! Integration tests for backend arbitration, configuration, and error
//! broadcasting through the public facade.

use kv_keeper::host::FlatStore;
use kv_keeper::{BackendType, ErrorKind, HostEnvironment, KeeperError, KeeperOptions};
use kv_keeper_test::prelude::*;
use serde_json::json;

#[tokio::test]
async fn test_auto_selects_transactional_when_both_exist() {
    init_test_logging();
    let keeper = test_keeper();
    let storage = keeper.get_storage(None).await.unwrap();
    assert_eq!(storage.backend_type(), BackendType::Transactional);
}

#[tokio::test]
async fn test_auto_falls_back_to_flat() {
    let (keeper, store) = flat_only_keeper();
    keeper.set_item("foo", "bar").await.unwrap();

    assert_eq!(
        keeper.get_storage(None).await.unwrap().backend_type(),
        BackendType::Flat
    );
    assert_eq!(
        store.get_item("kv-keeper:items:foo").as_deref(),
        Some("bar")
    );
}

#[tokio::test]
async fn test_no_backend_reports_platform_error() {
    let (keeper, log) = recording_keeper(HostEnvironment::new());

    let err = keeper.get_storage(None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert_eq!(
        log.messages(),
        vec!["[kv-keeper] This platform does not support any storages"]
    );
}

#[tokio::test]
async fn test_inaccessible_flat_store_is_unsupported() {
    let (keeper, log) = recording_keeper(flat_only_env(MockFlatStore::new().with_failing_probe()));

    let err = keeper
        .get_storage(Some(BackendType::Flat))
        .await
        .unwrap_err();
    assert!(matches!(err, KeeperError::Unsupported(BackendType::Flat)));
    assert_eq!(
        err.to_string(),
        "[kv-keeper] Storage with type \"flat\" is not supported"
    );
    assert_eq!(log.len(), 1);
}

#[tokio::test]
async fn test_write_failure_broadcast_exactly_once() {
    let (keeper, log) = recording_keeper(flat_only_env(MockFlatStore::new().with_failing_writes()));

    let err = keeper.set_item("k", "v").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HostRequest);
    match &err {
        KeeperError::HostRequest { event, .. } => assert_eq!(event.name, "QuotaExceededError"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(log.messages(), vec![err.to_string()]);
}

#[tokio::test]
async fn test_every_listener_sees_each_error() {
    let (keeper, first) = recording_keeper(HostEnvironment::new());
    let second = ErrorLog::new();
    keeper.add_error_listener(second.listener());

    assert!(keeper.has_item("k").await.is_err());
    assert!(keeper.get_keys().await.is_err());
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);

    keeper.remove_all_error_listeners();
    assert!(keeper.clear().await.is_err());
    assert_eq!(first.len(), 2);
}

#[tokio::test]
async fn test_configuration_applies_once() {
    let keeper = test_keeper();
    keeper
        .configure_from_json(json!({
            "name": "app",
            "recordCollectionName": "things",
            "defaultType": "ls",
        }))
        .unwrap();

    let config = keeper.config();
    assert_eq!(config.name(), "app");
    assert_eq!(config.record_collection(), "things");
    assert_eq!(config.default_type(), BackendType::Flat);
    assert_eq!(config.prefix(), "app:things:");

    let again = keeper.configure(KeeperOptions::new().with_name("other"));
    assert!(matches!(again, Err(KeeperError::Validation(_))));
    assert_eq!(keeper.config().name(), "app");
}

#[tokio::test]
async fn test_rejected_configuration_resets_and_locks() {
    let keeper = test_keeper();
    let err = keeper
        .configure_from_toml("name = \"app\"\ncolour = \"blue\"\n")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(keeper.config().name(), kv_keeper::DEFAULT_NAME);

    assert!(keeper.configure(KeeperOptions::new()).is_err());
}

#[tokio::test]
async fn test_flat_namespace_follows_configuration() {
    let (keeper, store) = flat_only_keeper();
    keeper
        .configure(
            KeeperOptions::new()
                .with_name("app")
                .with_record_collection("things"),
        )
        .unwrap();
    keeper.set_item("k", 1).await.unwrap();

    let keys = store.keys();
    assert_eq!(keys, vec!["app:things:k"]);
    assert_eq!(keeper.get_keys().await.unwrap(), vec!["k"]);
}

#[tokio::test]
async fn test_handles_share_the_cached_instance() {
    let keeper = test_keeper();
    let a = keeper.get_storage_named("db").await.unwrap();
    let b = keeper.get_storage_named("transactional").await.unwrap();
    let auto = keeper.get_storage_named("auto").await.unwrap();
    assert!(a.same_instance(&b));
    assert!(a.same_instance(&auto));

    a.set_item("shared", "yes").await.unwrap();
    assert_eq!(b.get_item("shared").await.unwrap().as_deref(), Some("yes"));
}

#[tokio::test]
async fn test_backends_are_independent() {
    let keeper = test_keeper();
    let flat = keeper.get_storage(Some(BackendType::Flat)).await.unwrap();
    let records = keeper
        .get_storage(Some(BackendType::Transactional))
        .await
        .unwrap();

    flat.set_item("k", "flat").await.unwrap();
    records.set_item("k", "records").await.unwrap();

    assert_eq!(flat.get_item("k").await.unwrap().as_deref(), Some("flat"));
    assert_eq!(records.get_item("k").await.unwrap().as_deref(), Some("records"));

    flat.clear().await.unwrap();
    assert_eq!(flat.get_length().await.unwrap(), 0);
    assert_eq!(records.get_length().await.unwrap(), 1);
}

#[tokio::test]
async fn test_foo_bar_scenario_on_every_backend() {
    for kind in [BackendType::Flat, BackendType::Transactional] {
        let keeper = test_keeper();
        let storage = keeper.get_storage(Some(kind)).await.unwrap();

        storage.set_item("foo", "bar").await.unwrap();
        assert_eq!(storage.get_item("foo").await.unwrap().as_deref(), Some("bar"));
        assert!(storage.has_item("foo").await.unwrap());
        storage.remove_item("foo").await.unwrap();
        assert!(!storage.has_item("foo").await.unwrap());
        storage.remove_item("foo").await.unwrap();

        storage.set_item("foo", "baz").await.unwrap();
        storage.set_item("bar", "qux").await.unwrap();
        let mut keys = storage.get_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["bar", "foo"], "{kind}");
        assert_eq!(storage.get_length().await.unwrap(), 2);

        storage.clear().await.unwrap();
        assert_eq!(storage.get_length().await.unwrap(), 0);
        assert!(storage.get_keys().await.unwrap().is_empty());
    }
}
