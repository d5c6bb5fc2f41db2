#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Behaviour every `RegistryBackend` must share, checked against the mock
//! through the trait object the registry uses.

use meshkit_backend::{
    BackendConnector, BackendError, ErrorKind, MockBackend, Pipeline, RegistryBackend, Ttl,
};
use std::sync::Arc;
use std::time::Duration;

fn backend() -> (MockBackend, Arc<dyn RegistryBackend>) {
    let mock = MockBackend::new();
    let dyn_backend: Arc<dyn RegistryBackend> = Arc::new(mock.clone());
    (mock, dyn_backend)
}

#[tokio::test]
async fn set_overwrites_value_and_ttl() {
    let (_, b) = backend();
    b.set_with_ttl("services:x", "v1", Duration::from_secs(10))
        .await
        .unwrap();
    b.set_with_ttl("services:x", "v2", Duration::from_secs(20))
        .await
        .unwrap();
    assert_eq!(b.get("services:x").await.unwrap().as_deref(), Some("v2"));
    assert_eq!(
        b.ttl("services:x").await.unwrap(),
        Ttl::Expires(Duration::from_secs(20))
    );
}

#[tokio::test]
async fn mget_preserves_order_and_gaps() {
    let (_, b) = backend();
    b.set_with_ttl("services:a", "A", Duration::from_secs(1))
        .await
        .unwrap();
    b.set_with_ttl("services:c", "C", Duration::from_secs(1))
        .await
        .unwrap();
    let keys: Vec<String> = ["services:a", "services:b", "services:c"]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();
    assert_eq!(
        b.mget(&keys).await.unwrap(),
        vec![Some("A".to_owned()), None, Some("C".to_owned())]
    );
    assert!(b.mget(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_and_expire_report_existence() {
    let (_, b) = backend();
    assert!(!b.delete("services:none").await.unwrap());
    assert!(!b.expire("services:none", Duration::from_secs(1)).await.unwrap());
    b.sadd("types:tool", "a").await.unwrap();
    assert_eq!(b.ttl("types:tool").await.unwrap(), Ttl::Persistent);
    assert!(b.expire("types:tool", Duration::from_secs(60)).await.unwrap());
    assert!(b.delete("types:tool").await.unwrap());
    assert_eq!(b.ttl("types:tool").await.unwrap(), Ttl::Missing);
}

#[tokio::test]
async fn union_and_intersection() {
    let (_, b) = backend();
    for (key, member) in [("s1", "a"), ("s1", "b"), ("s2", "b"), ("s2", "c")] {
        b.sadd(key, member).await.unwrap();
    }
    let keys = vec!["s1".to_owned(), "s2".to_owned()];
    assert_eq!(b.sinter(&keys).await.unwrap(), vec!["b".to_owned()]);
    let mut union = b.sunion(&keys).await.unwrap();
    union.sort();
    assert_eq!(union, vec!["a".to_owned(), "b".to_owned(), "c".to_owned()]);
    assert!(b.sinter(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn pipeline_is_all_or_nothing_when_unavailable() {
    let (mock, b) = backend();
    mock.set_available(false);
    let mut p = Pipeline::new();
    p.set_with_ttl("services:x", "{}", Duration::from_secs(30))
        .sadd("names:x", "x");
    let err = b.exec(p).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    mock.set_available(true);
    assert!(mock.keys().is_empty());
}

#[tokio::test]
async fn connector_hands_out_independent_clients() {
    let mock = MockBackend::new();
    let first = mock.connect().await.unwrap();
    let second = mock.connect().await.unwrap();
    first.close().await;
    assert!(matches!(first.ping().await, Err(BackendError::Closed)));
    second.ping().await.unwrap();
    second
        .set_with_ttl("services:x", "{}", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(mock.keys(), vec!["services:x".to_owned()]);
}

#[tokio::test]
async fn concurrent_writers_do_not_lose_members() {
    let (_, b) = backend();
    let mut tasks = Vec::new();
    for i in 0..32 {
        let b = Arc::clone(&b);
        tasks.push(tokio::spawn(async move {
            b.sadd("types:tool", &format!("svc-{i}")).await.unwrap();
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    assert_eq!(b.smembers("types:tool").await.unwrap().len(), 32);
}
