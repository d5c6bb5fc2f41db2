//! Filtered queries over the registry indexes.

use meshkit_backend::RegistryBackend;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{RegistryError, Result};
use crate::layout;
use crate::record::{ComponentType, ServiceRecord};

/// Conjunctive query. Every dimension is optional; the empty filter matches
/// every live record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryFilter {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub component_type: Option<ComponentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl DiscoveryFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn by_type(mut self, component_type: ComponentType) -> Self {
        self.component_type = Some(component_type);
        self
    }

    #[must_use]
    pub fn by_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        let capability = capability.into();
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    #[must_use]
    pub fn with_capabilities<I, S>(self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        capabilities
            .into_iter()
            .fold(self, |f, c| f.with_capability(c))
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.component_type.is_none()
            && self.name.is_none()
            && self.capabilities.is_empty()
            && self.metadata.is_empty()
    }

    /// Index sets to intersect: at most one type, at most one name, one per capability.
    #[must_use]
    pub fn index_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(2 + self.capabilities.len());
        if let Some(t) = self.component_type {
            keys.push(layout::type_key(t));
        }
        if let Some(name) = &self.name {
            keys.push(layout::name_key(name));
        }
        keys.extend(self.capabilities.iter().map(|c| layout::capability_key(c)));
        keys
    }

    /// Whether `record` satisfies every dimension of the filter.
    ///
    /// Index intersection already implies the indexed dimensions; they are
    /// re-checked so a membership left behind by an older version of a
    /// record cannot produce a hit.
    #[must_use]
    pub fn matches(&self, record: &ServiceRecord) -> bool {
        if self
            .component_type
            .is_some_and(|t| t != record.component_type)
        {
            return false;
        }
        if self.name.as_ref().is_some_and(|n| *n != record.name) {
            return false;
        }
        if !self.capabilities.iter().all(|c| record.has_capability(c)) {
            return false;
        }
        self.metadata
            .iter()
            .all(|(k, v)| record.metadata.get(k) == Some(v))
    }
}

/// Answers [`DiscoveryFilter`] queries against a backend.
#[derive(Clone)]
pub struct Discovery {
    backend: Arc<dyn RegistryBackend>,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("namespace", &self.backend.namespace())
            .finish()
    }
}

impl Discovery {
    #[must_use]
    pub fn new(backend: Arc<dyn RegistryBackend>) -> Self {
        Self { backend }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn RegistryBackend> {
        &self.backend
    }

    /// Records matching `filter`, in backend iteration order.
    ///
    /// Ids whose record has expired are skipped, as are records that cannot
    /// be decoded. Without any indexed dimension the whole `services:*`
    /// keyspace is scanned.
    ///
    /// # Errors
    /// Returns `RegistryError::Backend` on transport failures.
    pub async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<ServiceRecord>> {
        let index_keys = filter.index_keys();
        let record_keys: Vec<String> = if index_keys.is_empty() {
            self.backend.scan_keys(layout::SERVICES_PATTERN).await?
        } else {
            self.backend
                .sinter(&index_keys)
                .await?
                .iter()
                .map(|id| layout::service_key(id))
                .collect()
        };

        if record_keys.is_empty() {
            return Ok(Vec::new());
        }

        let values = self.backend.mget(&record_keys).await?;
        let mut records = Vec::with_capacity(values.len());
        for (key, raw) in record_keys.iter().zip(values) {
            let Some(raw) = raw else {
                tracing::trace!(key = %key, "skipping expired record");
                continue;
            };
            match layout::deserialize(&raw) {
                Ok(record) if filter.matches(&record) => records.push(record),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping malformed record");
                }
            }
        }

        tracing::debug!(
            ?filter,
            candidates = record_keys.len(),
            results = records.len(),
            "discovery query"
        );
        Ok(records)
    }

    /// Stored record for `id`, `None` once it expired.
    ///
    /// # Errors
    /// Backend failures, or `RegistryError::Malformed` for undecodable data.
    pub async fn get(&self, id: &str) -> Result<Option<ServiceRecord>> {
        let key = layout::service_key(id);
        let Some(raw) = self.backend.get(&key).await? else {
            return Ok(None);
        };
        layout::deserialize(&raw)
            .map(Some)
            .map_err(|source| RegistryError::Malformed { key, source })
    }

    /// # Errors
    /// Returns `RegistryError::Backend` on transport failures.
    pub async fn find_service(&self, name: &str) -> Result<Vec<ServiceRecord>> {
        self.discover(&DiscoveryFilter::new().by_name(name)).await
    }

    /// # Errors
    /// Returns `RegistryError::Backend` on transport failures.
    pub async fn find_by_capability(&self, capability: &str) -> Result<Vec<ServiceRecord>> {
        self.discover(&DiscoveryFilter::new().with_capability(capability))
            .await
    }

    /// # Errors
    /// Returns `RegistryError::Backend` on transport failures.
    pub async fn find_tools(&self) -> Result<Vec<ServiceRecord>> {
        self.discover(&DiscoveryFilter::new().by_type(ComponentType::Tool))
            .await
    }

    /// # Errors
    /// Returns `RegistryError::Backend` on transport failures.
    pub async fn find_agents(&self) -> Result<Vec<ServiceRecord>> {
        self.discover(&DiscoveryFilter::new().by_type(ComponentType::Agent))
            .await
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::record::Capability;
    use crate::registrar::{Registrar, RegistrySettings};
    use meshkit_backend::MockBackend;
    use serde_json::json;
    use std::time::Duration;

    async fn seeded() -> (MockBackend, Discovery) {
        let mock = MockBackend::new();
        let backend: Arc<dyn RegistryBackend> = Arc::new(mock.clone());
        let registrar = Registrar::new(Arc::clone(&backend), RegistrySettings::default());
        registrar
            .register(
                ServiceRecord::tool("svc-B", "alpha", "h", 1)
                    .with_capability(Capability::new("a"))
                    .with_capability(Capability::new("b"))
                    .with_metadata("region", "eu")
                    .with_metadata("replicas", 3),
            )
            .await
            .unwrap();
        registrar
            .register(
                ServiceRecord::tool("svc-C", "beta", "h", 2)
                    .with_capability(Capability::new("b"))
                    .with_capability(Capability::new("c"))
                    .with_metadata("region", "us"),
            )
            .await
            .unwrap();
        registrar
            .register(ServiceRecord::agent("agent-1", "planner", "h", 3))
            .await
            .unwrap();
        (mock, Discovery::new(backend))
    }

    fn ids(records: &[ServiceRecord]) -> Vec<&str> {
        let mut ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    #[tokio::test]
    async fn empty_filter_returns_everything() {
        let (_, discovery) = seeded().await;
        let all = discovery.discover(&DiscoveryFilter::new()).await.unwrap();
        assert_eq!(ids(&all), vec!["agent-1", "svc-B", "svc-C"]);
    }

    #[tokio::test]
    async fn metadata_predicates_compare_json_values() {
        let (_, discovery) = seeded().await;
        let f = DiscoveryFilter::new().with_metadata("region", "eu");
        assert_eq!(ids(&discovery.discover(&f).await.unwrap()), vec!["svc-B"]);

        let f = DiscoveryFilter::new().with_metadata("replicas", 3);
        assert_eq!(ids(&discovery.discover(&f).await.unwrap()), vec!["svc-B"]);

        let f = DiscoveryFilter::new().with_metadata("replicas", "3");
        assert!(discovery.discover(&f).await.unwrap().is_empty());

        let f = DiscoveryFilter::new()
            .by_type(ComponentType::Tool)
            .with_metadata("region", json!("mars"));
        assert!(discovery.discover(&f).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tombstones_are_dropped() {
        let (mock, discovery) = seeded().await;
        mock.expire_now("services:svc-C");
        let hits = discovery.find_by_capability("b").await.unwrap();
        assert_eq!(ids(&hits), vec!["svc-B"]);
        assert_eq!(
            mock.smembers("capabilities:c").await.unwrap(),
            vec!["svc-C".to_owned()]
        );
        assert!(discovery.get("svc-C").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let (mock, discovery) = seeded().await;
        mock.set_with_ttl("services:svc-C", "not json", Duration::from_secs(30))
            .await
            .unwrap();
        let hits = discovery.find_tools().await.unwrap();
        assert_eq!(ids(&hits), vec!["svc-B"]);
        assert!(matches!(
            discovery.get("svc-C").await,
            Err(RegistryError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn stale_membership_does_not_match() {
        let (mock, discovery) = seeded().await;
        // Left behind by an older version of svc-C.
        mock.sadd("capabilities:z", "svc-C").await.unwrap();
        assert!(discovery.find_by_capability("z").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn convenience_queries() {
        let (_, discovery) = seeded().await;
        assert_eq!(ids(&discovery.find_agents().await.unwrap()), vec!["agent-1"]);
        assert_eq!(ids(&discovery.find_service("beta").await.unwrap()), vec!["svc-C"]);
        assert!(discovery.find_service("gamma").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transport_errors_surface() {
        let (mock, discovery) = seeded().await;
        mock.set_available(false);
        let err = discovery.find_tools().await.unwrap_err();
        assert!(err.is_connection());
    }

    #[test]
    fn filter_index_keys() {
        let f = DiscoveryFilter::new()
            .by_type(ComponentType::Agent)
            .by_name("x")
            .with_capabilities(["a", "b", "a"]);
        assert_eq!(
            f.index_keys(),
            vec!["types:agent", "names:x", "capabilities:a", "capabilities:b"]
        );
        assert!(DiscoveryFilter::new().with_metadata("k", "v").index_keys().is_empty());
        assert!(DiscoveryFilter::new().is_empty());
    }
}
