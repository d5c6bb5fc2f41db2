//! The `RegistryBackend` contract implemented by the Redis client and the mock.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::pipeline::Pipeline;

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Key exists and expires after the given duration.
    Expires(Duration),
    /// Key exists without an expiry.
    Persistent,
    /// Key does not exist.
    Missing,
}

impl Ttl {
    /// Decode a Redis `PTTL` reply.
    #[must_use]
    pub fn from_pttl(millis: i64) -> Self {
        match millis {
            -2 => Self::Missing,
            -1 => Self::Persistent,
            ms => Self::Expires(Duration::from_millis(u64::try_from(ms).unwrap_or_default())),
        }
    }

    #[must_use]
    pub fn remaining(self) -> Option<Duration> {
        match self {
            Self::Expires(d) => Some(d),
            Self::Persistent | Self::Missing => None,
        }
    }
}

/// Typed operations over the backing store.
///
/// All keys are logical; implementations apply the namespace prefix. Every
/// call is a suspension point and may be cancelled by dropping the future.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Namespace applied to every key.
    fn namespace(&self) -> &str;

    /// Atomically set `key` to `value` expiring after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Fetch several string keys in one round trip, preserving order.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Returns `true` when the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Refresh the TTL of an existing key. Returns `false` when the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn ttl(&self, key: &str) -> Result<Ttl>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    async fn srem(&self, key: &str, member: &str) -> Result<()>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Members present in every set. A missing set counts as empty.
    ///
    /// The default fetches each set and intersects locally; backends with a
    /// native primitive override it.
    async fn sinter(&self, keys: &[String]) -> Result<Vec<String>> {
        let Some((first, rest)) = keys.split_first() else {
            return Ok(Vec::new());
        };
        let mut acc = self.smembers(first).await?;
        for key in rest {
            if acc.is_empty() {
                break;
            }
            let other: HashSet<String> = self.smembers(key).await?.into_iter().collect();
            acc.retain(|m| other.contains(m));
        }
        Ok(acc)
    }

    /// Members present in any of the sets.
    async fn sunion(&self, keys: &[String]) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for key in keys {
            for member in self.smembers(key).await? {
                if seen.insert(member.clone()) {
                    out.push(member);
                }
            }
        }
        Ok(out)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Members with `min <= score <= max`, ascending by score.
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>>;

    async fn zrem(&self, key: &str, member: &str) -> Result<()>;

    /// Logical keys matching a glob pattern. O(N) over the keyspace.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Execute every command of the pipeline in a single transaction.
    async fn exec(&self, pipeline: Pipeline) -> Result<()>;

    /// Health ping.
    async fn ping(&self) -> Result<()>;

    /// Release the connection pool. Later calls fail with `BackendError::Closed`.
    async fn close(&self);
}

/// Builds fresh backend clients; used when reconnecting after an outage.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn RegistryBackend>>;
}
