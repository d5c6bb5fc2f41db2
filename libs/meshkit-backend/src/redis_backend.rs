//! Redis implementation of [`RegistryBackend`].

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendConnector, RegistryBackend, Ttl};
use crate::config::BackendConfig;
use crate::error::{BackendError, Result};
use crate::keyspace::{Keyspace, check_db};
use crate::pipeline::{Command, Pipeline, ttl_millis};

/// Page size hint for `SCAN`.
const SCAN_COUNT: usize = 200;

/// Redis client backed by a shared, auto-reconnecting `ConnectionManager`.
///
/// Cloning the manager is cheap; each command works on its own clone so
/// concurrent callers (heartbeat, discovery, retry) share one pool.
pub struct RedisBackend {
    conn: RwLock<Option<ConnectionManager>>,
    keyspace: Keyspace,
    op_timeout: Duration,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("namespace", &self.keyspace.namespace())
            .field("op_timeout", &self.op_timeout)
            .field("closed", &self.conn.read().is_none())
            .finish()
    }
}

impl RedisBackend {
    /// Connect and verify the server answers `PING` within `connect_timeout`.
    ///
    /// # Errors
    /// - `BackendError::Config` for a malformed URL or database number
    /// - `BackendError::Connection`/`Timeout` when the server is unreachable
    pub async fn connect(config: &BackendConfig) -> Result<Self> {
        let url = config.connection_url()?;
        check_db(config.db)?;

        let client = redis::Client::open(url.as_str())
            .map_err(|e| BackendError::Config(format!("failed to create redis client: {e}")))?;

        let manager = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| BackendError::Timeout {
                op: "CONNECT",
                after: config.connect_timeout,
            })?
            .map_err(|e| BackendError::from_redis("CONNECT", &e))?;

        let backend = Self {
            conn: RwLock::new(Some(manager)),
            keyspace: config.keyspace(),
            op_timeout: config.op_timeout,
        };

        backend.ping_within(config.connect_timeout).await?;
        tracing::debug!(
            namespace = %config.namespace,
            db = config.db,
            "connected to redis registry backend"
        );
        Ok(backend)
    }

    fn connection(&self) -> Result<ConnectionManager> {
        self.conn.read().clone().ok_or(BackendError::Closed)
    }

    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        self.call_within(op, self.op_timeout, f).await
    }

    async fn call_within<T, F, Fut>(&self, op: &'static str, deadline: Duration, f: F) -> Result<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let conn = self.connection()?;
        match tokio::time::timeout(deadline, f(conn)).await {
            Ok(res) => res.map_err(|e| BackendError::from_redis(op, &e)),
            Err(_) => Err(BackendError::Timeout {
                op,
                after: deadline,
            }),
        }
    }

    async fn ping_within(&self, deadline: Duration) -> Result<()> {
        let reply: String = self
            .call_within("PING", deadline, |mut conn| async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(BackendError::connection(
                "PING",
                format!("unexpected reply '{reply}'"),
            ))
        }
    }

    fn build_pipeline(&self, pipeline: Pipeline) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in pipeline {
            match command {
                Command::Set { key, value, ttl } => {
                    pipe.cmd("SET")
                        .arg(self.keyspace.key(&key))
                        .arg(value)
                        .arg("PX")
                        .arg(ttl_millis(ttl))
                        .ignore();
                }
                Command::Del { key } => {
                    pipe.cmd("DEL").arg(self.keyspace.key(&key)).ignore();
                }
                Command::SAdd { key, member } => {
                    pipe.cmd("SADD")
                        .arg(self.keyspace.key(&key))
                        .arg(member)
                        .ignore();
                }
                Command::SRem { key, member } => {
                    pipe.cmd("SREM")
                        .arg(self.keyspace.key(&key))
                        .arg(member)
                        .ignore();
                }
                Command::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE")
                        .arg(self.keyspace.key(&key))
                        .arg(ttl_millis(ttl))
                        .ignore();
                }
            }
        }
        pipe
    }
}

#[async_trait]
impl RegistryBackend for RedisBackend {
    fn namespace(&self) -> &str {
        self.keyspace.namespace()
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let key = self.keyspace.key(key);
        let value = value.to_owned();
        self.call("SET", |mut conn| async move {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async::<()>(&mut conn)
                .await
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = self.keyspace.key(key);
        self.call("GET", |mut conn| async move {
            redis::cmd("GET").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let keys = self.keyspace.keys(keys);
        self.call("MGET", |mut conn| async move {
            redis::cmd("MGET").arg(keys).query_async(&mut conn).await
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = self.keyspace.key(key);
        let removed: u64 = self
            .call("DEL", |mut conn| async move {
                redis::cmd("DEL").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let key = self.keyspace.key(key);
        let applied: u64 = self
            .call("PEXPIRE", |mut conn| async move {
                redis::cmd("PEXPIRE")
                    .arg(key)
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(applied == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Ttl> {
        let key = self.keyspace.key(key);
        let millis: i64 = self
            .call("PTTL", |mut conn| async move {
                redis::cmd("PTTL").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(Ttl::from_pttl(millis))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let key = self.keyspace.key(key);
        let member = member.to_owned();
        self.call("SADD", |mut conn| async move {
            redis::cmd("SADD")
                .arg(key)
                .arg(member)
                .query_async::<()>(&mut conn)
                .await
        })
        .await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let key = self.keyspace.key(key);
        let member = member.to_owned();
        self.call("SREM", |mut conn| async move {
            redis::cmd("SREM")
                .arg(key)
                .arg(member)
                .query_async::<()>(&mut conn)
                .await
        })
        .await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let key = self.keyspace.key(key);
        self.call("SMEMBERS", |mut conn| async move {
            redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn sinter(&self, keys: &[String]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let keys = self.keyspace.keys(keys);
        self.call("SINTER", |mut conn| async move {
            redis::cmd("SINTER").arg(keys).query_async(&mut conn).await
        })
        .await
    }

    async fn sunion(&self, keys: &[String]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let keys = self.keyspace.keys(keys);
        self.call("SUNION", |mut conn| async move {
            redis::cmd("SUNION").arg(keys).query_async(&mut conn).await
        })
        .await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let key = self.keyspace.key(key);
        let member = member.to_owned();
        self.call("ZADD", |mut conn| async move {
            redis::cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .query_async::<()>(&mut conn)
                .await
        })
        .await
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>> {
        let key = self.keyspace.key(key);
        self.call("ZRANGEBYSCORE", |mut conn| async move {
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(min)
                .arg(max)
                .arg("WITHSCORES")
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let key = self.keyspace.key(key);
        let member = member.to_owned();
        self.call("ZREM", |mut conn| async move {
            redis::cmd("ZREM")
                .arg(key)
                .arg(member)
                .query_async::<()>(&mut conn)
                .await
        })
        .await
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let full_pattern = self.keyspace.key(pattern);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let pattern = full_pattern.clone();
            let (next, batch): (u64, Vec<String>) = self
                .call("SCAN", |mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT)
                        .query_async(&mut conn)
                        .await
                })
                .await?;
            keys.extend(
                batch
                    .iter()
                    .filter_map(|k| self.keyspace.strip(k).map(str::to_owned)),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once across pages.
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn exec(&self, pipeline: Pipeline) -> Result<()> {
        if pipeline.is_empty() {
            return Ok(());
        }
        let pipe = self.build_pipeline(pipeline);
        self.call("EXEC", |mut conn| async move {
            pipe.query_async::<()>(&mut conn).await
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.ping_within(self.op_timeout).await
    }

    async fn close(&self) {
        if self.conn.write().take().is_some() {
            tracing::debug!(namespace = %self.keyspace.namespace(), "redis backend closed");
        }
    }
}

/// Connector that dials a fresh [`RedisBackend`] on every call.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    config: BackendConfig,
}

impl RedisConnector {
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BackendConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn RegistryBackend>> {
        let backend = RedisBackend::connect(&self.config).await?;
        Ok(Arc::new(backend))
    }
}
