//! Tools and agents.
//!
//! Both register themselves; only an [`Agent`] can query the registry.

use async_trait::async_trait;
use meshkit_backend::BackendConnector;
use meshkit_bootstrap::MeshConfig;
use meshkit_registry::{
    Capability, Catalog, ComponentType, Discovery, DiscoveryFilter, HealthStatus, Registrar,
    ServiceRecord, catalog,
};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::node::Node;
use crate::slot::RegistrationState;

/// Lifecycle every registerable component exposes.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    fn component_type(&self) -> ComponentType;

    /// Apply validated configuration. Must be called before [`Component::start`].
    ///
    /// # Errors
    /// Returns a config error if `config` fails validation.
    fn configure(&mut self, config: &MeshConfig) -> Result<()>;

    /// Register and start heartbeating. With `retry_on_failure` an unreachable
    /// backend is not an error: the component keeps running unregistered and
    /// registers in the background. Cancelling `cancel` stops the heartbeat
    /// and any retrying.
    ///
    /// # Errors
    /// Config, fatal record and (without retry) connection errors.
    async fn start(&self, cancel: CancellationToken) -> Result<()>;

    /// Stop background work, unregister within `http.shutdown_timeout` and
    /// close the backend.
    ///
    /// # Errors
    /// Reserved for failures that leave the component in an unknown state;
    /// unregister failures are logged.
    async fn shutdown(&self) -> Result<()>;

    /// # Errors
    /// Backend failures while rewriting the record.
    async fn set_health(&self, health: HealthStatus) -> Result<()>;

    fn state(&self) -> RegistrationState;

    /// Record this component registers (available once started).
    fn record(&self) -> Option<ServiceRecord>;

    fn health_url(&self) -> String;
}

macro_rules! delegate_component {
    ($ty:ty) => {
        #[async_trait]
        impl Component for $ty {
            fn name(&self) -> &str {
                self.node.name()
            }

            fn component_type(&self) -> ComponentType {
                self.node.component_type()
            }

            fn configure(&mut self, config: &MeshConfig) -> Result<()> {
                self.node.configure(config)
            }

            async fn start(&self, cancel: CancellationToken) -> Result<()> {
                self.node.start(cancel).await
            }

            async fn shutdown(&self) -> Result<()> {
                self.node.shutdown().await
            }

            async fn set_health(&self, health: HealthStatus) -> Result<()> {
                self.node.set_health(health).await
            }

            fn state(&self) -> RegistrationState {
                self.node.state()
            }

            fn record(&self) -> Option<ServiceRecord> {
                self.node.record()
            }

            fn health_url(&self) -> String {
                self.node.health_url()
            }
        }
    };
}

macro_rules! component_builders {
    ($ty:ty) => {
        impl $ty {
            #[must_use]
            pub fn with_capability(mut self, capability: Capability) -> Self {
                self.node.add_capability(capability);
                self
            }

            #[must_use]
            pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
                self.node.insert_metadata(key.into(), value.into());
                self
            }

            /// Use `connector` instead of the configured provider.
            #[must_use]
            pub fn with_connector(mut self, connector: Arc<dyn BackendConnector>) -> Self {
                self.node.set_connector(connector);
                self
            }

            #[must_use]
            pub fn capabilities(&self) -> &[Capability] {
                self.node.capabilities()
            }

            #[must_use]
            pub fn config(&self) -> &MeshConfig {
                self.node.config()
            }

            /// Health published with the record, kept while unregistered.
            #[must_use]
            pub fn health(&self) -> HealthStatus {
                self.node.health()
            }

            /// Live registrar, `None` while unregistered or retrying.
            pub async fn registrar(&self) -> Option<Arc<Registrar>> {
                self.node.registrar().await
            }
        }
    };
}

/// Passive capability provider.
#[derive(Debug)]
pub struct Tool {
    node: Node,
}

impl Tool {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            node: Node::new(name, ComponentType::Tool),
        }
    }
}

component_builders!(Tool);
delegate_component!(Tool);

/// Component that also discovers and orchestrates others.
#[derive(Debug)]
pub struct Agent {
    node: Node,
}

impl Agent {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            node: Node::new(name, ComponentType::Agent),
        }
    }

    /// Discovery over the live registrar's backend.
    pub async fn discovery(&self) -> Option<Discovery> {
        self.node
            .registrar()
            .await
            .map(|r| Discovery::new(Arc::clone(r.backend())))
    }

    /// Records matching `filter`. Empty while the agent is not registered.
    ///
    /// # Errors
    /// Backend failures.
    pub async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<ServiceRecord>> {
        let Some(discovery) = self.discovery().await else {
            tracing::debug!(agent = %self.node.name(), "not registered, discovery returns nothing");
            return Ok(Vec::new());
        };
        Ok(discovery.discover(filter).await?)
    }

    /// # Errors
    /// Backend failures.
    pub async fn find_service(&self, name: &str) -> Result<Vec<ServiceRecord>> {
        self.discover(&DiscoveryFilter::new().by_name(name)).await
    }

    /// # Errors
    /// Backend failures.
    pub async fn find_by_capability(&self, capability: &str) -> Result<Vec<ServiceRecord>> {
        self.discover(&DiscoveryFilter::new().with_capability(capability))
            .await
    }

    /// # Errors
    /// Backend failures.
    pub async fn find_tools(&self) -> Result<Vec<ServiceRecord>> {
        self.discover(&DiscoveryFilter::new().by_type(ComponentType::Tool))
            .await
    }

    /// # Errors
    /// Backend failures.
    pub async fn find_agents(&self) -> Result<Vec<ServiceRecord>> {
        self.discover(&DiscoveryFilter::new().by_type(ComponentType::Agent))
            .await
    }

    /// Capability listing of every other live component, internal
    /// capabilities omitted.
    ///
    /// # Errors
    /// Backend failures.
    pub async fn catalog(&self) -> Result<Catalog> {
        let own_id = self.node.record().map(|r| r.id);
        let mut records = self.discover(&DiscoveryFilter::new()).await?;
        records.retain(|r| Some(&r.id) != own_id.as_ref());
        Ok(catalog(&records))
    }
}

component_builders!(Agent);
delegate_component!(Agent);
