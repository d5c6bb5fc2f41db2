#![cfg(feature = "integration")]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::use_debug)]

//! TTL behaviour against a real Redis. Requires Docker.
//!
//! Run with `cargo test -p meshkit-registry --features integration`.

use anyhow::Result;
use meshkit_backend::{
    BackendConfig, BackendConnector, RedisBackend, RedisConnector, RegistryBackend, Ttl,
};
use meshkit_registry::{
    Capability, Discovery, DiscoveryFilter, Registrar, RegistrySettings, RetryOutcome,
    RetrySupervisor, ServiceRecord,
};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::redis::{REDIS_PORT, Redis};
use tokio_util::sync::CancellationToken;

struct RedisUnderTest {
    config: BackendConfig,
    _container: ContainerAsync<Redis>,
}

async fn bring_up_redis(namespace: &str) -> Result<RedisUnderTest> {
    let container = Redis::default().start().await?;
    let port = container.get_host_port_ipv4(REDIS_PORT).await?;
    let config = BackendConfig::default()
        .with_url(format!("redis://127.0.0.1:{port}"))
        .with_namespace(namespace);
    Ok(RedisUnderTest {
        config,
        _container: container,
    })
}

fn weather() -> ServiceRecord {
    ServiceRecord::tool("svc-A", "weather", "127.0.0.1", 8080)
        .with_capability(Capability::new("weather"))
}

fn remaining(ttl: Ttl) -> Duration {
    ttl.remaining().expect("key should carry an expiry")
}

#[tokio::test]
async fn ttls_refresh_under_steady_heartbeat() -> Result<()> {
    let redis = bring_up_redis("s1").await?;
    let backend: Arc<dyn RegistryBackend> = Arc::new(RedisBackend::connect(&redis.config).await?);
    let registrar = Registrar::new(
        Arc::clone(&backend),
        RegistrySettings::with_ttl(Duration::from_secs(10)),
    );
    let discovery = Discovery::new(Arc::clone(&backend));
    let token = CancellationToken::new();

    registrar.register(weather()).await?;
    registrar.start_heartbeat("svc-A", &token).await?;

    for _ in 0..15 {
        let record_ttl = remaining(backend.ttl("services:svc-A").await?);
        let index_ttl = remaining(backend.ttl("capabilities:weather").await?);
        assert!(record_ttl >= Duration::from_secs(4), "record ttl {record_ttl:?}");
        assert!(record_ttl <= Duration::from_secs(10));
        assert!(index_ttl >= Duration::from_secs(14), "index ttl {index_ttl:?}");
        assert!(index_ttl <= Duration::from_secs(20));
        assert!(index_ttl > record_ttl);

        let hits = discovery.find_by_capability("weather").await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "svc-A");
        tokio::time::sleep(Duration::from_secs(4)).await;
    }

    token.cancel();
    registrar.unregister("svc-A").await?;
    assert!(discovery.discover(&DiscoveryFilter::new()).await?.is_empty());
    backend.close().await;
    Ok(())
}

#[tokio::test]
async fn dead_service_disappears() -> Result<()> {
    let redis = bring_up_redis("s2").await?;
    let backend: Arc<dyn RegistryBackend> = Arc::new(RedisBackend::connect(&redis.config).await?);
    let registrar = Registrar::new(
        Arc::clone(&backend),
        RegistrySettings::with_ttl(Duration::from_secs(10)),
    );
    let discovery = Discovery::new(Arc::clone(&backend));
    let token = CancellationToken::new();

    registrar.register(weather()).await?;
    registrar.start_heartbeat("svc-A", &token).await?;
    tokio::time::sleep(Duration::from_secs(12)).await;
    registrar.stop_heartbeat("svc-A").await;

    tokio::time::sleep(Duration::from_secs(13)).await;
    assert!(discovery.find_by_capability("weather").await?.is_empty());
    // The membership outlives the record; it must not produce a hit.
    assert!(
        backend
            .smembers("capabilities:weather")
            .await?
            .contains(&"svc-A".to_owned())
    );
    Ok(())
}

/// Connector whose target appears only once the container is up.
#[derive(Default)]
struct LateConnector {
    config: parking_lot::Mutex<Option<BackendConfig>>,
}

#[async_trait::async_trait]
impl BackendConnector for LateConnector {
    async fn connect(&self) -> meshkit_backend::Result<Arc<dyn RegistryBackend>> {
        let config = self.config.lock().clone();
        match config {
            Some(config) => RedisConnector::new(config).connect().await,
            None => RedisConnector::new(
                BackendConfig::default()
                    .with_url("redis://127.0.0.1:1")
                    .with_namespace("s3"),
            )
            .connect()
            .await,
        }
    }
}

#[tokio::test]
async fn retry_registers_once_redis_is_reachable() -> Result<()> {
    let connector = Arc::new(LateConnector::default());
    let (tx, rx) = tokio::sync::oneshot::channel();
    let supervisor = RetrySupervisor::start(
        Arc::clone(&connector) as Arc<dyn BackendConnector>,
        weather(),
        RegistrySettings::with_ttl(Duration::from_secs(10)),
        Duration::from_secs(1),
        &CancellationToken::new(),
        move |registrar| async move {
            assert!(tx.send(registrar).is_ok());
        },
    );

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!supervisor.is_finished());
    let redis = bring_up_redis("s3").await?;
    *connector.config.lock() = Some(redis.config.clone());

    let outcome = tokio::time::timeout(Duration::from_secs(5), supervisor.wait()).await?;
    assert_eq!(outcome, RetryOutcome::Registered);
    let registrar = rx.await?;
    let stored = registrar.fetch("svc-A").await?;
    assert_eq!(stored.map(|r| r.id).as_deref(), Some("svc-A"));
    registrar.backend().close().await;
    Ok(())
}
