//! Store contract conformance, run against every backend.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{init_tracing, Cluster};
use coordkv_store::{LockOptions, StoreError, WriteOptions};
use tokio_util::sync::CancellationToken;

fn keys_of(pairs: &[coordkv_store::KvPair]) -> Vec<String> {
    let mut keys: Vec<String> = pairs.iter().map(|p| p.key.clone()).collect();
    keys.sort();
    keys
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_put_get_delete_round_trip() {
    init_tracing();
    for cluster in Cluster::all() {
        let store = cluster.open();
        let opts = WriteOptions::default();

        store.put("app/config", b"v1", &opts).await.unwrap();
        let pair = store.get("app/config").await.unwrap();
        assert_eq!(pair.value, b"v1", "{}", cluster.name());
        assert_eq!(pair.key, "app/config");
        assert_ne!(pair.last_index, 0);

        store.delete("app/config").await.unwrap();
        let err = store.get("app/config").await.unwrap_err();
        assert!(err.is_not_found(), "{}: {}", cluster.name(), err);
        assert!(store.delete("app/config").await.unwrap_err().is_not_found());
        store.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_value_and_trailing_slash() {
    for cluster in Cluster::all() {
        let store = cluster.open();
        store
            .put("/flags/empty/", b"", &WriteOptions::default())
            .await
            .unwrap();
        let pair = store.get("flags/empty").await.unwrap();
        assert!(pair.value.is_empty(), "{}", cluster.name());
        assert_eq!(store.get("/flags//empty").await.unwrap(), pair);
        assert!(store.exists("flags/empty/").await.unwrap());
        store.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_index_strictly_increases() {
    for cluster in Cluster::all() {
        let store = cluster.open();
        let mut last = 0;
        for i in 0..5u8 {
            store.put("counter", &[i], &WriteOptions::default()).await.unwrap();
            let index = store.get("counter").await.unwrap().last_index;
            assert!(index > last, "{}: {} <= {}", cluster.name(), index, last);
            last = index;
        }
        store.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_list_and_delete_tree() {
    for cluster in Cluster::all() {
        let store = cluster.open();
        let opts = WriteOptions::default();
        store.put("svc/a", b"1", &opts).await.unwrap();
        store.put("svc/b", b"2", &opts).await.unwrap();
        store.put("svcx/c", b"3", &opts).await.unwrap();

        let listed = store.list("svc").await.unwrap();
        assert_eq!(keys_of(&listed), vec!["svc/a", "svc/b"], "{}", cluster.name());
        assert!(store.list("missing").await.unwrap_err().is_not_found());

        store.delete_tree("svc").await.unwrap();
        assert!(
            store.list("svc").await.unwrap_err().is_not_found(),
            "{}",
            cluster.name()
        );
        assert_eq!(store.list("svcx").await.unwrap().len(), 1);
        store.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_compare_and_swap_laws() {
    for cluster in Cluster::all() {
        let store = cluster.open();
        let opts = WriteOptions::default();

        let created = store.atomic_put("cas", b"1", None, &opts).await.unwrap();
        assert!(matches!(
            store.atomic_put("cas", b"x", None, &opts).await,
            Err(StoreError::KeyExists { .. })
        ));

        let read = store.get("cas").await.unwrap();
        assert_eq!(read.last_index, created.last_index, "{}", cluster.name());
        let swapped = store.atomic_put("cas", b"2", Some(&read), &opts).await.unwrap();
        assert!(swapped.last_index > read.last_index);

        // A write in between invalidates the old pair.
        assert!(matches!(
            store.atomic_put("cas", b"3", Some(&read), &opts).await,
            Err(StoreError::KeyModified { .. })
        ));
        assert!(matches!(
            store.atomic_delete("cas", None).await,
            Err(StoreError::PreviousNotSpecified)
        ));
        assert!(matches!(
            store.atomic_delete("cas", Some(&read)).await,
            Err(StoreError::KeyModified { .. })
        ));
        let current = store.get("cas").await.unwrap();
        store.atomic_delete("cas", Some(&current)).await.unwrap();
        assert!(store.get("cas").await.unwrap_err().is_not_found());
        store.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_create_has_one_winner() {
    for cluster in Cluster::all() {
        let store = cluster.open();
        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .atomic_put("leader", &[i], None, &WriteOptions::default())
                    .await
            }));
        }
        let mut winners = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => winners += 1,
                Err(StoreError::KeyExists { .. }) => {}
                Err(e) => panic!("{}: unexpected error {}", cluster.name(), e),
            }
        }
        assert_eq!(winners, 1, "{}", cluster.name());
        store.close().await;
    }
}

#[tokio::test]
async fn test_embedded_reports_missing_capabilities() {
    let cluster = Cluster::embedded();
    let store = cluster.open();
    let caps = store.capabilities();
    assert!(!caps.supports_watch && !caps.supports_lock && !caps.supports_ttl);
    assert!(matches!(
        caps.require_watch(store.backend()),
        Err(StoreError::NotSupported(_))
    ));
    assert!(matches!(
        store.watch("k", CancellationToken::new()).await,
        Err(StoreError::NotSupported(_))
    ));
    assert!(matches!(
        store.new_lock("k", LockOptions::default()).await,
        Err(StoreError::NotSupported(_))
    ));
    assert!(matches!(
        store
            .put("k", b"v", &WriteOptions::with_ttl(Duration::from_secs(1)))
            .await,
        Err(StoreError::NotSupported(_))
    ));
    store.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_closed_handle_rejects_calls() {
    for cluster in Cluster::all() {
        let store = cluster.open();
        store.put("k", b"v", &WriteOptions::default()).await.unwrap();
        store.close().await;
        assert!(
            matches!(store.get("k").await, Err(StoreError::Closed)),
            "{}",
            cluster.name()
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_watch_starts_with_current_value() {
    for cluster in Cluster::clustered() {
        let store = cluster.open();
        store.put("w/k", b"1", &WriteOptions::default()).await.unwrap();
        let current = store.get("w/k").await.unwrap();
        let mut rx = store.watch("w/k", CancellationToken::new()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), current, "{}", cluster.name());

        assert!(store
            .watch("w/missing", CancellationToken::new())
            .await
            .unwrap_err()
            .is_not_found());
        store.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_watch_ends_on_cancel() {
    for cluster in Cluster::clustered() {
        let store = cluster.open();
        store.put("w/k", b"1", &WriteOptions::default()).await.unwrap();
        let cancel = CancellationToken::new();
        let mut rx = store.watch("w/k", cancel.clone()).await.unwrap();
        assert!(rx.recv().await.is_some());
        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(end.is_none(), "{}", cluster.name());
        store.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_watch_sees_every_distinct_write() {
    for cluster in Cluster::clustered() {
        let store = cluster.open();
        let writer = cluster.open();
        store.put("w/seq", b"0", &WriteOptions::default()).await.unwrap();
        let mut rx = store.watch("w/seq", CancellationToken::new()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().value, b"0");

        let mut seen = Vec::new();
        for value in [b"1", b"2", b"3"] {
            writer.put("w/seq", value, &WriteOptions::default()).await.unwrap();
            let next = tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(next.value);
        }
        assert_eq!(
            seen,
            vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()],
            "{}",
            cluster.name()
        );
        writer.close().await;
        store.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lock_excludes_second_holder() {
    for cluster in Cluster::clustered() {
        let a = cluster.open();
        let b = cluster.open();
        let options = LockOptions::with_ttl(Duration::from_secs(2)).value("owner");
        let lock_a = a.new_lock("locks/x", options.clone()).await.unwrap();
        let lock_b = b.new_lock("locks/x", options).await.unwrap();

        let held = lock_a.acquire(CancellationToken::new()).await.unwrap();
        let cancel = CancellationToken::new();
        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { lock_b.acquire(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!waiter.is_finished(), "{}", cluster.name());
        cancel.cancel();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(StoreError::Cancelled)
        ));
        assert!(!held.is_cancelled());

        lock_a.release().await.unwrap();
        assert!(held.is_cancelled());
        a.close().await;
        b.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_do_not_collide() {
    for cluster in Cluster::all() {
        let store = cluster.open();
        let opts = WriteOptions::default();
        let keys = ["a/b", "a/bc", "ab/c"];
        for key in keys {
            store.put(key, key.as_bytes(), &opts).await.unwrap();
        }
        let mut seen = HashSet::new();
        for key in keys {
            let pair = store.get(key).await.unwrap();
            assert_eq!(pair.value, key.as_bytes());
            seen.insert(pair.key);
        }
        assert_eq!(seen.len(), 3, "{}", cluster.name());
        store.close().await;
    }
}
