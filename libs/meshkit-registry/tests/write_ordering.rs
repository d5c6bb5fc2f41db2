#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Ordering of concurrent writes for one id and failure handling of the
//! index refresh, driven through a backend that can stall or fail on demand.

use async_trait::async_trait;
use meshkit_backend::{BackendError, MockBackend, Pipeline, RegistryBackend, Result, Ttl};
use meshkit_registry::{
    Capability, HealthStatus, Registrar, RegistrySettings, ServiceRecord, layout,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Delegates to a [`MockBackend`]; can stall the next record write or fail
/// every pipeline.
struct FlakyBackend {
    inner: MockBackend,
    stall_next_set: Mutex<Option<Duration>>,
    fail_exec: AtomicBool,
}

impl FlakyBackend {
    fn new(inner: MockBackend) -> Self {
        Self {
            inner,
            stall_next_set: Mutex::new(None),
            fail_exec: AtomicBool::new(false),
        }
    }

    fn stall_next_set(&self, delay: Duration) {
        *self.stall_next_set.lock() = Some(delay);
    }
}

#[async_trait]
impl RegistryBackend for FlakyBackend {
    fn namespace(&self) -> &str {
        self.inner.namespace()
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let stall = self.stall_next_set.lock().take();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.inner.mget(keys).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.inner.expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<Ttl> {
        self.inner.ttl(key).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.inner.sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        self.inner.srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.inner.smembers(key).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.inner.zadd(key, member, score).await
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>> {
        self.inner.zrangebyscore(key, min, max).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        self.inner.zrem(key, member).await
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.inner.scan_keys(pattern).await
    }

    async fn exec(&self, pipeline: Pipeline) -> Result<()> {
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(BackendError::Command {
                op: "EXEC",
                message: "EXECABORT".to_owned(),
            });
        }
        self.inner.exec(pipeline).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

fn setup() -> (MockBackend, Arc<FlakyBackend>, Registrar) {
    let mock = MockBackend::new();
    let flaky = Arc::new(FlakyBackend::new(mock.clone()));
    let registrar = Registrar::new(
        Arc::clone(&flaky) as Arc<dyn RegistryBackend>,
        RegistrySettings::default(),
    );
    (mock, flaky, registrar)
}

fn svc(caps: &[&str]) -> ServiceRecord {
    caps.iter().fold(
        ServiceRecord::tool("svc", "svc", "10.0.0.9", 8080),
        |r, c| r.with_capability(Capability::new(*c)),
    )
}

async fn stored(mock: &MockBackend) -> ServiceRecord {
    let raw = mock.get("services:svc").await.unwrap().unwrap();
    layout::deserialize(&raw).unwrap()
}

#[tokio::test(start_paused = true)]
async fn health_update_is_not_overwritten_by_a_slow_heartbeat() {
    let (mock, flaky, registrar) = setup();
    let cancel = CancellationToken::new();
    registrar.register(svc(&["old"])).await.unwrap();
    registrar.start_heartbeat("svc", &cancel).await.unwrap();

    // The beat at 15 s stalls for 2 s inside its record write.
    flaky.stall_next_set(Duration::from_secs(2));
    tokio::time::sleep(Duration::from_millis(15_100)).await;

    registrar
        .update_health("svc", HealthStatus::Healthy)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(stored(&mock).await.health, HealthStatus::Healthy);
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn reregister_is_not_overwritten_by_a_slow_heartbeat() {
    let (mock, flaky, registrar) = setup();
    let cancel = CancellationToken::new();
    registrar.register(svc(&["old"])).await.unwrap();
    registrar.start_heartbeat("svc", &cancel).await.unwrap();

    flaky.stall_next_set(Duration::from_secs(2));
    tokio::time::sleep(Duration::from_millis(15_100)).await;

    registrar.register(svc(&["new"])).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    let caps: Vec<String> = stored(&mock)
        .await
        .capabilities
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(caps, vec!["new".to_owned()]);
    assert!(mock.smembers("capabilities:old").await.unwrap().is_empty());
    assert_eq!(
        mock.smembers("capabilities:new").await.unwrap(),
        vec!["svc".to_owned()]
    );
    cancel.cancel();
}

#[tokio::test]
async fn health_update_survives_index_refresh_failure() {
    let (mock, flaky, registrar) = setup();
    registrar.register(svc(&["forecast"])).await.unwrap();

    flaky.fail_exec.store(true, Ordering::SeqCst);
    registrar
        .update_health("svc", HealthStatus::Unhealthy)
        .await
        .unwrap();

    assert_eq!(stored(&mock).await.health, HealthStatus::Unhealthy);
    assert_eq!(
        registrar.current("svc").unwrap().health,
        HealthStatus::Unhealthy
    );
}
