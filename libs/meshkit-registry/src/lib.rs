//! Service registry protocol: record schema and index layout, registration
//! with heartbeat, filtered discovery and background retry.

pub mod address;
pub mod catalog;
pub mod discovery;
pub mod error;
pub mod layout;
pub mod record;
pub mod registrar;
pub mod retry;
pub mod throttled_log;

pub use address::{
    KubernetesConfig, ResolvedAddress, deployment_metadata, resolve_address, service_id,
};
pub use catalog::{Catalog, CatalogEntry, catalog};
pub use discovery::{Discovery, DiscoveryFilter};
pub use error::{RegistryError, Result};
pub use record::{Capability, ComponentType, FieldHint, HealthStatus, ServiceRecord};
pub use registrar::{DEFAULT_RECORD_TTL, Registrar, RegistrySettings};
pub use retry::{DEFAULT_RETRY_INTERVAL, RetryOutcome, RetrySupervisor};
pub use throttled_log::{DEFAULT_WARN_INTERVAL, FailureLog};

pub use meshkit_backend::ErrorKind;
