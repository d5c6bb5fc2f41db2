//! In-memory backend with the same contract as Redis.
//!
//! TTLs are recorded but never enforced; tests drive expiry explicitly via
//! [`MockBackend::expire_now`]. Clones share one store, so a test can keep a
//! handle while the component under test owns another. Keys are prefixed with
//! the handle's namespace exactly like the Redis client does, so handles in
//! different namespaces over one store never see each other's data.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::backend::{BackendConnector, RegistryBackend, Ttl};
use crate::error::{BackendError, Result};
use crate::keyspace::Keyspace;
use crate::pipeline::{Command, Pipeline};

#[derive(Debug, Default)]
struct Store {
    strings: BTreeMap<String, String>,
    sets: BTreeMap<String, BTreeSet<String>>,
    zsets: BTreeMap<String, BTreeMap<String, f64>>,
    ttls: HashMap<String, Duration>,
}

impl Store {
    fn exists(&self, key: &str) -> bool {
        self.strings.contains_key(key) || self.sets.contains_key(key) || self.zsets.contains_key(key)
    }

    fn remove(&mut self, key: &str) -> bool {
        self.ttls.remove(key);
        let a = self.strings.remove(key).is_some();
        let b = self.sets.remove(key).is_some();
        let c = self.zsets.remove(key).is_some();
        a || b || c
    }

    fn set(&mut self, key: &str, value: String, ttl: Duration) {
        self.sets.remove(key);
        self.zsets.remove(key);
        self.strings.insert(key.to_owned(), value);
        self.ttls.insert(key.to_owned(), ttl);
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        if self.exists(key) {
            self.ttls.insert(key.to_owned(), ttl);
            true
        } else {
            false
        }
    }

    fn sadd(&mut self, key: &str, member: String) {
        self.sets.entry(key.to_owned()).or_default().insert(member);
    }

    fn srem(&mut self, key: &str, member: &str) {
        if let Some(set) = self.sets.get_mut(key) {
            set.remove(member);
            // Redis drops empty sets, and their TTL with them.
            if set.is_empty() {
                self.sets.remove(key);
                self.ttls.remove(key);
            }
        }
    }

    fn apply(&mut self, keyspace: &Keyspace, command: Command) {
        match command {
            Command::Set { key, value, ttl } => self.set(&keyspace.key(&key), value, ttl),
            Command::Del { key } => {
                self.remove(&keyspace.key(&key));
            }
            Command::SAdd { key, member } => self.sadd(&keyspace.key(&key), member),
            Command::SRem { key, member } => self.srem(&keyspace.key(&key), &member),
            Command::Expire { key, ttl } => {
                self.expire(&keyspace.key(&key), ttl);
            }
        }
    }
}

/// In-memory [`RegistryBackend`] for tests and local runs.
#[derive(Debug, Clone)]
pub struct MockBackend {
    store: Arc<Mutex<Store>>,
    available: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    keyspace: Keyspace,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_namespace("meshkit")
    }

    #[must_use]
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            available: Arc::new(AtomicBool::new(true)),
            closed: Arc::new(AtomicBool::new(false)),
            keyspace: Keyspace::new(namespace),
        }
    }

    /// Another client on the same store with its own open/closed state.
    #[must_use]
    pub fn reopen(&self) -> Self {
        self.in_namespace(self.keyspace.namespace())
    }

    /// Another client on the same store and availability switch, working in
    /// `namespace`.
    #[must_use]
    pub fn in_namespace(&self, namespace: impl Into<String>) -> Self {
        Self {
            store: Arc::clone(&self.store),
            available: Arc::clone(&self.available),
            closed: Arc::new(AtomicBool::new(false)),
            keyspace: Keyspace::new(namespace),
        }
    }

    /// Simulate an outage: every call fails with a connection error while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drop a key as if its TTL had elapsed. Returns `true` when it existed.
    pub fn expire_now(&self, key: &str) -> bool {
        self.store.lock().remove(&self.keyspace.key(key))
    }

    /// TTL last requested for `key`, if any.
    #[must_use]
    pub fn recorded_ttl(&self, key: &str) -> Option<Duration> {
        self.store.lock().ttls.get(&self.keyspace.key(key)).copied()
    }

    /// Live logical keys of this handle's namespace, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let store = self.store.lock();
        let mut keys: Vec<String> = store
            .strings
            .keys()
            .chain(store.sets.keys())
            .chain(store.zsets.keys())
            .filter_map(|k| self.keyspace.strip(k).map(str::to_owned))
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Wipe all data in every namespace.
    pub fn clear(&self) {
        *self.store.lock() = Store::default();
    }

    fn check(&self, op: &'static str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::connection(op, "mock backend unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryBackend for MockBackend {
    fn namespace(&self) -> &str {
        self.keyspace.namespace()
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check("SET")?;
        self.store.lock().set(&self.keyspace.key(key), value.to_owned(), ttl);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check("GET")?;
        Ok(self.store.lock().strings.get(&self.keyspace.key(key)).cloned())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.check("MGET")?;
        let store = self.store.lock();
        Ok(keys
            .iter()
            .map(|k| store.strings.get(&self.keyspace.key(k)).cloned())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check("DEL")?;
        Ok(self.store.lock().remove(&self.keyspace.key(key)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check("PEXPIRE")?;
        Ok(self.store.lock().expire(&self.keyspace.key(key), ttl))
    }

    async fn ttl(&self, key: &str) -> Result<Ttl> {
        self.check("PTTL")?;
        let key = self.keyspace.key(key);
        let store = self.store.lock();
        if !store.exists(&key) {
            return Ok(Ttl::Missing);
        }
        Ok(store.ttls.get(&key).map_or(Ttl::Persistent, |d| Ttl::Expires(*d)))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.check("SADD")?;
        self.store.lock().sadd(&self.keyspace.key(key), member.to_owned());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        self.check("SREM")?;
        self.store.lock().srem(&self.keyspace.key(key), member);
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.check("SMEMBERS")?;
        Ok(self
            .store
            .lock()
            .sets
            .get(&self.keyspace.key(key))
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sinter(&self, keys: &[String]) -> Result<Vec<String>> {
        self.check("SINTER")?;
        let store = self.store.lock();
        let Some((first, rest)) = keys.split_first() else {
            return Ok(Vec::new());
        };
        let Some(base) = store.sets.get(&self.keyspace.key(first)) else {
            return Ok(Vec::new());
        };
        let rest: Vec<String> = self.keyspace.keys(rest);
        Ok(base
            .iter()
            .filter(|m| {
                rest.iter()
                    .all(|k| store.sets.get(k).is_some_and(|s| s.contains(*m)))
            })
            .cloned()
            .collect())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.check("ZADD")?;
        self.store
            .lock()
            .zsets
            .entry(self.keyspace.key(key))
            .or_default()
            .insert(member.to_owned(), score);
        Ok(())
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>> {
        self.check("ZRANGEBYSCORE")?;
        let store = self.store.lock();
        let mut hits: Vec<(String, f64)> = store
            .zsets
            .get(&self.keyspace.key(key))
            .map(|z| {
                z.iter()
                    .filter(|(_, s)| **s >= min && **s <= max)
                    .map(|(m, s)| (m.clone(), *s))
                    .collect()
            })
            .unwrap_or_default();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(hits)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        self.check("ZREM")?;
        let key = self.keyspace.key(key);
        let mut store = self.store.lock();
        if let Some(z) = store.zsets.get_mut(&key) {
            z.remove(member);
            if z.is_empty() {
                store.zsets.remove(&key);
                store.ttls.remove(&key);
            }
        }
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.check("SCAN")?;
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| BackendError::Config(format!("invalid key pattern '{pattern}': {e}")))?;
        Ok(self
            .keys()
            .into_iter()
            .filter(|k| pattern.matches(k))
            .collect())
    }

    async fn exec(&self, pipeline: Pipeline) -> Result<()> {
        self.check("EXEC")?;
        let mut store = self.store.lock();
        for command in pipeline {
            store.apply(&self.keyspace, command);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check("PING")
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackendConnector for MockBackend {
    async fn connect(&self) -> Result<Arc<dyn RegistryBackend>> {
        if !self.is_available() {
            return Err(BackendError::connection("CONNECT", "mock backend unavailable"));
        }
        Ok(Arc::new(self.reopen()))
    }
}
