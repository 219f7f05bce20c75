//! Integration tests for the facade over a `SurrealKV`-backed host.

#![cfg(feature = "kv")]

use kv_keeper::host::SurrealRecordHost;
use kv_keeper::{BackendType, KeeperOptions, KvKeeper};
use kv_keeper_test::prelude::*;

#[tokio::test]
async fn test_facade_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let host = SurrealRecordHost::open(dir.path()).unwrap();
    let keeper = KvKeeper::new(record_only_env(host.clone()));

    keeper.set_item("a", 1).await.unwrap();
    keeper.set_item("b", "two").await.unwrap();
    assert_eq!(
        keeper.get_storage(None).await.unwrap().backend_type(),
        BackendType::Transactional
    );
    assert_eq!(keeper.get_item("a").await.unwrap().as_deref(), Some("1"));
    assert_eq!(keeper.get_keys().await.unwrap(), vec!["a", "b"]);

    keeper.remove_item("a").await.unwrap();
    assert!(!keeper.has_item("a").await.unwrap());
    keeper.clear().await.unwrap();
    assert_eq!(keeper.get_length().await.unwrap(), 0);
}

#[tokio::test]
async fn test_data_persists_across_hosts() {
    let dir = tempfile::tempdir().unwrap();
    {
        let host = SurrealRecordHost::open(dir.path()).unwrap();
        let keeper = KvKeeper::new(record_only_env(host.clone()));
        keeper
            .configure(KeeperOptions::new().with_name("app"))
            .unwrap();
        keeper.set_item("k", "v").await.unwrap();
        keeper.get_storage(None).await.unwrap().close();
        host.close().await.unwrap();
    }

    let host = SurrealRecordHost::open(dir.path()).unwrap();
    let keeper = KvKeeper::new(record_only_env(host));
    keeper
        .configure(KeeperOptions::new().with_name("app"))
        .unwrap();
    assert_eq!(keeper.get_item("k").await.unwrap().as_deref(), Some("v"));
}
