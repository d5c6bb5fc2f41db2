//! Publishes service records and keeps them alive.

use chrono::Utc;
use dashmap::DashMap;
use meshkit_backend::RegistryBackend;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{RegistryError, Result};
use crate::layout::{self, IndexMembership};
use crate::record::{HealthStatus, ServiceRecord};
use crate::throttled_log::FailureLog;

/// Default record TTL (`T`).
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(30);

/// Record TTL and heartbeat period of a registrar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    pub record_ttl: Duration,
    pub heartbeat_period: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_RECORD_TTL)
    }
}

impl RegistrySettings {
    /// Settings for a record TTL, heartbeating every `ttl / 2`.
    #[must_use]
    pub fn with_ttl(record_ttl: Duration) -> Self {
        Self {
            record_ttl,
            heartbeat_period: record_ttl / 2,
        }
    }

    #[must_use]
    pub fn with_heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    #[must_use]
    pub fn index_ttl(&self) -> Duration {
        layout::index_ttl(self.record_ttl)
    }
}

struct Core {
    backend: Arc<dyn RegistryBackend>,
    settings: RegistrySettings,
    records: DashMap<String, ServiceRecord>,
    /// Serialises every write of one id, heartbeat included, so a write that
    /// started earlier can never land after a later one.
    write_locks: DashMap<String, Arc<Mutex<()>>>,
    failures: FailureLog,
}

impl Core {
    fn write_lock(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.write_locks.entry(id.to_owned()).or_default().value())
    }

    /// Rewrite the record with TTL `T`, then re-join and refresh its indexes.
    ///
    /// Only the record write is reported; index refresh failures are logged.
    async fn refresh(&self, record: &ServiceRecord) -> Result<()> {
        let raw = layout::serialize(record)?;
        self.backend
            .set_with_ttl(
                &layout::service_key(&record.id),
                &raw,
                self.settings.record_ttl,
            )
            .await?;

        let indexes = layout::index_refresh_pipeline(record, self.settings.record_ttl);
        if let Err(e) = self.backend.exec(indexes).await {
            tracing::warn!(
                service_id = %record.id,
                error = %e,
                "failed to refresh index TTLs"
            );
        }
        Ok(())
    }

    async fn beat(&self, id: &str) -> Result<()> {
        let lock = self.write_lock(id);
        let _guard = lock.lock().await;
        // Read under the lock: the cache always holds the latest write.
        let Some(mut record) = self.records.get(id).map(|r| r.clone()) else {
            // Unregistered while the tick was pending.
            return Ok(());
        };
        record.last_seen = Utc::now();
        self.refresh(&record).await?;
        if let Some(mut cached) = self.records.get_mut(id) {
            cached.last_seen = record.last_seen;
        }
        Ok(())
    }

    async fn run_heartbeat(self: Arc<Self>, id: String, token: CancellationToken) {
        let period = self.settings.heartbeat_period;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(service_id = %id, ?period, "heartbeat started");
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let outcome = tokio::select! {
                () = token.cancelled() => break,
                res = self.beat(&id) => res,
            };

            match outcome {
                Ok(()) => {
                    if let Some(streak) = self.failures.success() {
                        tracing::info!(service_id = %id, failures = streak, "heartbeat recovered");
                    }
                }
                Err(e) => {
                    if let Some(streak) = self.failures.failure() {
                        tracing::warn!(
                            service_id = %id,
                            consecutive = streak,
                            error = %e,
                            "heartbeat failed"
                        );
                    } else {
                        tracing::debug!(service_id = %id, error = %e, "heartbeat failed");
                    }
                }
            }
        }
        tracing::debug!(service_id = %id, "heartbeat stopped");
    }
}

struct Heartbeat {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Writes records and their index memberships and runs one heartbeat task
/// per registered id.
///
/// Heartbeat tasks hold the shared core, never the registrar itself, so
/// dropping the registrar cancels nothing implicitly; call
/// [`Registrar::stop_all`] first.
pub struct Registrar {
    core: Arc<Core>,
    heartbeats: DashMap<String, Heartbeat>,
}

impl std::fmt::Debug for Registrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrar")
            .field("namespace", &self.core.backend.namespace())
            .field("settings", &self.core.settings)
            .field("records", &self.core.records.len())
            .field("heartbeats", &self.heartbeats.len())
            .finish()
    }
}

impl Registrar {
    #[must_use]
    pub fn new(backend: Arc<dyn RegistryBackend>, settings: RegistrySettings) -> Self {
        Self {
            core: Arc::new(Core {
                backend,
                settings,
                records: DashMap::new(),
                write_locks: DashMap::new(),
                failures: FailureLog::default(),
            }),
            heartbeats: DashMap::new(),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn RegistryBackend> {
        &self.core.backend
    }

    #[must_use]
    pub fn settings(&self) -> RegistrySettings {
        self.core.settings
    }

    /// Publish `record`, replacing any previous record with the same id.
    ///
    /// The record (TTL `T`), removal of memberships the previous version had
    /// but this one lacks, and every index membership (TTL `2·T`) are written
    /// in one transaction.
    ///
    /// # Errors
    /// - `RegistryError::InvalidRecord` if the record fails validation
    /// - `RegistryError::Backend` if the backend is unreachable
    pub async fn register(&self, mut record: ServiceRecord) -> Result<ServiceRecord> {
        record.validate()?;
        let lock = self.core.write_lock(&record.id);
        let _guard = lock.lock().await;
        record.last_seen = Utc::now();

        let previous = self.previous_memberships(&record.id).await?;
        let stale = layout::stale_memberships(&previous, &layout::index_memberships(&record));
        let pipeline = layout::write_pipeline(&record, self.core.settings.record_ttl, &stale)?;
        self.core.backend.exec(pipeline).await?;

        tracing::info!(
            service_id = %record.id,
            name = %record.name,
            component_type = %record.component_type,
            address = %record.address,
            port = record.port,
            capabilities = record.capabilities.len(),
            "service registered"
        );
        self.core.records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    /// Memberships of the record currently known under `id`, from this
    /// registrar or from the store.
    async fn previous_memberships(&self, id: &str) -> Result<Vec<IndexMembership>> {
        let mut memberships = self
            .core
            .records
            .get(id)
            .map(|r| layout::index_memberships(&r))
            .unwrap_or_default();

        let key = layout::service_key(id);
        if let Some(raw) = self.core.backend.get(&key).await? {
            match layout::deserialize(&raw) {
                Ok(stored) => {
                    for m in layout::index_memberships(&stored) {
                        if !memberships.contains(&m) {
                            memberships.push(m);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "ignoring malformed stored record");
                }
            }
        }
        Ok(memberships)
    }

    /// Spawn the heartbeat for `id`, replacing a running one.
    ///
    /// The loop ticks every heartbeat period and stops when `parent` is
    /// cancelled or [`Registrar::stop_heartbeat`] is called.
    ///
    /// # Errors
    /// Returns `RegistryError::NotFound` if `id` was not registered through
    /// this registrar.
    pub async fn start_heartbeat(&self, id: &str, parent: &CancellationToken) -> Result<()> {
        if !self.core.records.contains_key(id) {
            return Err(RegistryError::NotFound(id.to_owned()));
        }
        self.stop_heartbeat(id).await;

        let token = parent.child_token();
        let handle = tokio::spawn(
            Arc::clone(&self.core).run_heartbeat(id.to_owned(), token.clone()),
        );
        self.heartbeats
            .insert(id.to_owned(), Heartbeat { token, handle });
        Ok(())
    }

    /// Cancel the heartbeat of `id` and wait for it to exit.
    /// Returns `false` if none was running.
    pub async fn stop_heartbeat(&self, id: &str) -> bool {
        let Some((_, heartbeat)) = self.heartbeats.remove(id) else {
            return false;
        };
        heartbeat.token.cancel();
        if let Err(e) = heartbeat.handle.await {
            tracing::warn!(service_id = %id, error = %e, "heartbeat task ended abnormally");
        }
        true
    }

    /// Stop every heartbeat owned by this registrar.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.heartbeats.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop_heartbeat(&id).await;
        }
    }

    #[must_use]
    pub fn heartbeat_running(&self, id: &str) -> bool {
        self.heartbeats
            .get(id)
            .is_some_and(|h| !h.handle.is_finished())
    }

    /// Record last written by this registrar for `id`.
    #[must_use]
    pub fn current(&self, id: &str) -> Option<ServiceRecord> {
        self.core.records.get(id).map(|r| r.clone())
    }

    #[must_use]
    pub fn registered_ids(&self) -> Vec<String> {
        self.core.records.iter().map(|e| e.key().clone()).collect()
    }

    /// Read the stored record of `id`.
    ///
    /// # Errors
    /// Backend failures, or `RegistryError::Malformed` for undecodable data.
    pub async fn fetch(&self, id: &str) -> Result<Option<ServiceRecord>> {
        let key = layout::service_key(id);
        let Some(raw) = self.core.backend.get(&key).await? else {
            return Ok(None);
        };
        layout::deserialize(&raw)
            .map(Some)
            .map_err(|source| RegistryError::Malformed { key, source })
    }

    /// Rewrite the health of `id`, keeping every other field, and refresh
    /// record and index TTLs.
    ///
    /// # Errors
    /// - `RegistryError::NotFound` if the record is neither known locally nor stored
    /// - `RegistryError::Backend` if the record write fails
    pub async fn update_health(&self, id: &str, health: HealthStatus) -> Result<()> {
        let lock = self.core.write_lock(id);
        let _guard = lock.lock().await;
        let mut record = match self.current(id) {
            Some(r) => r,
            None => self
                .fetch(id)
                .await?
                .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?,
        };
        record.health = health;
        record.last_seen = Utc::now();
        self.core.refresh(&record).await?;

        tracing::debug!(service_id = %id, ?health, "health updated");
        self.core.records.insert(id.to_owned(), record);
        Ok(())
    }

    /// Stop the heartbeat of `id`, delete its record and leave every index
    /// it belonged to. A missing record is not an error.
    ///
    /// # Errors
    /// Returns `RegistryError::Backend` if the backend cannot be reached.
    pub async fn unregister(&self, id: &str) -> Result<()> {
        self.stop_heartbeat(id).await;

        let lock = self.core.write_lock(id);
        let _guard = lock.lock().await;
        let memberships = self.previous_memberships(id).await?;
        self.core
            .backend
            .exec(layout::removal_pipeline(id, &memberships))
            .await?;
        self.core.records.remove(id);

        tracing::info!(service_id = %id, "service unregistered");
        Ok(())
    }
}
