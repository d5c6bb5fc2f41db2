//! Registration lifecycle shared by tools and agents.

use meshkit_backend::{BackendConnector, MockBackend, RedisConnector, RegistryBackend};
use meshkit_bootstrap::{DiscoveryProvider, MeshConfig};
use meshkit_registry::{
    Capability, ComponentType, HealthStatus, Registrar, RegistryError, ResolvedAddress,
    RetrySupervisor, ServiceRecord, deployment_metadata, resolve_address, service_id,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use tokio_util::sync::CancellationToken;

use crate::error::{ComponentError, Result};
use crate::slot::{RegistrationSlot, RegistrationState};

/// Registry shared by every component of this process when the provider
/// is `mock`.
static LOCAL_REGISTRY: LazyLock<MockBackend> = LazyLock::new(MockBackend::new);

/// Handle on the process-local registry used by the `mock` provider, scoped
/// to `namespace` like a Redis connection would be.
#[must_use]
pub fn local_registry(namespace: &str) -> MockBackend {
    LOCAL_REGISTRY.in_namespace(namespace)
}

pub struct Node {
    name: String,
    component_type: ComponentType,
    capabilities: Vec<Capability>,
    metadata: BTreeMap<String, Value>,
    config: MeshConfig,
    connector: Option<Arc<dyn BackendConnector>>,
    slot: Arc<RegistrationSlot>,
    record: RwLock<Option<ServiceRecord>>,
    /// Last health asked for, applied whenever a registrar goes live.
    health: Arc<Mutex<HealthStatus>>,
    supervisor: Mutex<Option<RetrySupervisor>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("component_type", &self.component_type)
            .field("capabilities", &self.capabilities.len())
            .field("metadata", &self.metadata)
            .field("config", &self.config)
            .field("connector", &self.connector.is_some())
            .field("slot", &self.slot.state())
            .field("record", &self.record.read().as_ref().map(|r| r.id.clone()))
            .field("health", &*self.health.lock())
            .field("supervisor", &self.supervisor.lock().is_some())
            .field("cancel", &self.cancel.lock().is_some())
            .finish()
    }
}

impl Node {
    pub fn new(name: impl Into<String>, component_type: ComponentType) -> Self {
        Self {
            name: name.into(),
            component_type,
            capabilities: Vec::new(),
            metadata: BTreeMap::new(),
            config: MeshConfig::default(),
            connector: None,
            slot: RegistrationSlot::new(),
            record: RwLock::new(None),
            health: Arc::new(Mutex::new(HealthStatus::default())),
            supervisor: Mutex::new(None),
            cancel: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component_type(&self) -> ComponentType {
        self.component_type
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn add_capability(&mut self, capability: Capability) {
        if let Some(existing) = self
            .capabilities
            .iter_mut()
            .find(|c| c.name == capability.name)
        {
            *existing = capability;
        } else {
            self.capabilities.push(capability);
        }
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn insert_metadata(&mut self, key: String, value: Value) {
        self.metadata.insert(key, value);
    }

    pub fn set_connector(&mut self, connector: Arc<dyn BackendConnector>) {
        self.connector = Some(connector);
    }

    pub fn configure(&mut self, config: &MeshConfig) -> Result<()> {
        config.validate()?;
        for capability in &config.component.capabilities {
            let mut capability = capability.clone();
            if capability.endpoint.is_empty() {
                capability.endpoint = format!("/api/capabilities/{}", capability.name);
            }
            self.add_capability(capability);
        }
        for (k, v) in &config.component.metadata {
            self.metadata.entry(k.clone()).or_insert_with(|| v.clone());
        }
        if !config.component.description.is_empty() {
            self.metadata
                .entry("description".to_owned())
                .or_insert_with(|| Value::from(config.component.description.as_str()));
        }
        if let Some(version) = &config.component.version {
            self.metadata
                .entry("version".to_owned())
                .or_insert_with(|| Value::from(version.as_str()));
        }
        self.config = config.clone();
        Ok(())
    }

    /// Address advertised in the registry and for health checks.
    pub fn address(&self) -> ResolvedAddress {
        resolve_address(
            &self.config.kubernetes,
            self.config.http.address.as_deref(),
            self.config.http.port,
        )
    }

    pub fn health_url(&self) -> String {
        self.address().health_url()
    }

    pub fn state(&self) -> RegistrationState {
        let state = self.slot.state();
        let cancelled = self
            .cancel
            .lock()
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled);
        if cancelled && state == RegistrationState::Retrying {
            return RegistrationState::Terminated;
        }
        state
    }

    pub fn record(&self) -> Option<ServiceRecord> {
        self.record.read().clone()
    }

    pub fn slot(&self) -> &Arc<RegistrationSlot> {
        &self.slot
    }

    /// Live registrar, if registered.
    pub async fn registrar(&self) -> Option<Arc<Registrar>> {
        self.slot.registrar().await
    }

    fn build_record(&self) -> ServiceRecord {
        let address = self.address();
        let id = self
            .record
            .read()
            .as_ref()
            .map_or_else(|| service_id(&self.name, &self.config.kubernetes), |r| r.id.clone());

        let mut record = ServiceRecord::new(
            id,
            self.name.clone(),
            self.component_type,
            address.host,
            address.port,
        );
        record.capabilities.clone_from(&self.capabilities);
        record.health = *self.health.lock();
        record.metadata = deployment_metadata(&self.config.kubernetes);
        record
            .metadata
            .extend(self.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        record
    }

    fn connector(&self) -> Arc<dyn BackendConnector> {
        if let Some(connector) = &self.connector {
            return Arc::clone(connector);
        }
        match self.config.discovery.provider {
            DiscoveryProvider::Mock => Arc::new(local_registry(&self.config.backend.namespace)),
            DiscoveryProvider::Redis => Arc::new(RedisConnector::new(self.config.backend.clone())),
        }
    }

    async fn connect_and_register(
        connector: &dyn BackendConnector,
        record: &ServiceRecord,
        config: &MeshConfig,
    ) -> std::result::Result<Registrar, RegistryError> {
        let backend: Arc<dyn RegistryBackend> = connector.connect().await?;
        let registrar = Registrar::new(Arc::clone(&backend), config.registry_settings());
        if let Err(e) = registrar.register(record.clone()).await {
            backend.close().await;
            return Err(e);
        }
        Ok(registrar)
    }

    /// Register, start the heartbeat, or hand over to the retry supervisor.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        match self.slot.state() {
            RegistrationState::Unregistered => {}
            RegistrationState::Terminated => {
                return Err(ComponentError::Terminated(self.name.clone()));
            }
            RegistrationState::Live | RegistrationState::Retrying => {
                return Err(ComponentError::AlreadyStarted(self.name.clone()));
            }
        }
        *self.cancel.lock() = Some(cancel.clone());

        if !self.config.discovery.enabled {
            tracing::info!(component = %self.name, "discovery disabled, running without registry");
            return Ok(());
        }

        let record = self.build_record();
        record.validate()?;
        *self.record.write() = Some(record.clone());

        let handle = self.slot.install_handle().await;
        let connector = self.connector();

        let outcome = Self::connect_and_register(connector.as_ref(), &record, &self.config).await;
        match outcome {
            Ok(registrar) => {
                let installed = handle
                    .install(Arc::new(registrar), &record.id, &cancel)
                    .await?;
                if !installed {
                    return Err(ComponentError::Terminated(self.name.clone()));
                }
                tracing::info!(
                    service_id = %record.id,
                    health_url = %self.health_url(),
                    "component registered"
                );
                Ok(())
            }
            Err(e) if e.is_connection() && self.config.discovery.retry_on_failure => {
                tracing::warn!(
                    service_id = %record.id,
                    error = %e,
                    retry_interval = ?self.config.discovery.retry_interval,
                    "registry unreachable, continuing unregistered and retrying in background"
                );
                self.slot.set_state(RegistrationState::Retrying);
                let id = record.id.clone();
                let install_cancel = cancel.clone();
                let health = Arc::clone(&self.health);
                let supervisor = RetrySupervisor::start(
                    connector,
                    record,
                    self.config.registry_settings(),
                    self.config.discovery.retry_interval,
                    &cancel,
                    move |registrar| async move {
                        match handle
                            .install(Arc::clone(&registrar), &id, &install_cancel)
                            .await
                        {
                            Ok(true) => sync_health(&registrar, &id, &health).await,
                            Ok(false) => {}
                            Err(e) => {
                                tracing::warn!(service_id = %id, error = %e, "failed to install registrar");
                            }
                        }
                    },
                );
                *self.supervisor.lock() = Some(supervisor);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record the component's health. While registered the registry record
    /// is rewritten at once; otherwise the value is kept and published by the
    /// next successful registration.
    ///
    /// # Errors
    /// Backend failures while rewriting the record.
    pub async fn set_health(&self, health: HealthStatus) -> Result<()> {
        *self.health.lock() = health;
        let id = {
            let mut record = self.record.write();
            let Some(record) = record.as_mut() else {
                return Ok(());
            };
            record.health = health;
            record.id.clone()
        };
        if let Some(registrar) = self.registrar().await {
            registrar.update_health(&id, health).await?;
        }
        Ok(())
    }

    #[must_use]
    pub fn health(&self) -> HealthStatus {
        *self.health.lock()
    }

    /// Stop retrying and heartbeating, unregister within the shutdown timeout
    /// and close the backend.
    pub async fn shutdown(&self) -> Result<()> {
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
        }

        let registrar = self.slot.take().await;
        self.slot.set_state(RegistrationState::Terminated);
        let Some(registrar) = registrar else {
            return Ok(());
        };
        registrar.stop_all().await;

        let timeout = self.config.http.shutdown_timeout;
        for id in registrar.registered_ids() {
            match tokio::time::timeout(timeout, registrar.unregister(&id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(service_id = %id, error = %e, "failed to unregister");
                }
                Err(_) => {
                    tracing::warn!(service_id = %id, ?timeout, "unregister timed out");
                }
            }
        }
        registrar.backend().close().await;
        tracing::info!(component = %self.name, "component shut down");
        Ok(())
    }
}

/// Publish a health change that arrived while the registrar was still being
/// set up.
async fn sync_health(registrar: &Registrar, id: &str, health: &Mutex<HealthStatus>) {
    let wanted = *health.lock();
    if registrar.current(id).is_some_and(|r| r.health == wanted) {
        return;
    }
    if let Err(e) = registrar.update_health(id, wanted).await {
        tracing::warn!(service_id = %id, error = %e, "failed to publish pending health");
    }
}
