//! Layered node configuration.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults
//! 2. YAML file (`--config`)
//! 3. `MESHKIT__*` environment variables, nested with `__`
//!    (`MESHKIT__BACKEND__URL`, `MESHKIT__RECORD__TTL=10s`)
//! 4. Kubernetes downward-API variables (`KUBERNETES_SERVICE_HOST`,
//!    `POD_NAME`, `POD_NAMESPACE`, `SERVICE_NAME`)
//! 5. CLI overrides

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use meshkit_backend::{BackendConfig, BackendError, ErrorKind, check_db};
use meshkit_registry::{
    Capability, ComponentType, DEFAULT_RECORD_TTL, DEFAULT_RETRY_INTERVAL, KubernetesConfig,
    RegistrySettings,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::logging::LoggingConfig;

/// Prefix of environment variables merged into the configuration.
pub const ENV_PREFIX: &str = "MESHKIT__";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file does not exist: {0}")]
    MissingFile(PathBuf),

    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Backend(e) => e.kind(),
            Self::MissingFile(_) | Self::Load(_) | Self::Invalid(_) => ErrorKind::Config,
        }
    }
}

/// Which backend the registry runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryProvider {
    #[default]
    Redis,
    /// Process-local in-memory registry.
    Mock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Run without any registry when `false`
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub provider: DiscoveryProvider,
    /// Keep starting and register in the background when the backend is down
    #[serde(default = "default_true")]
    pub retry_on_failure: bool,
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
}

fn default_true() -> bool {
    true
}

fn default_retry_interval() -> Duration {
    DEFAULT_RETRY_INTERVAL
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: DiscoveryProvider::default(),
            retry_on_failure: true,
            retry_interval: default_retry_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordConfig {
    /// Record TTL; index sets live twice as long
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

fn default_ttl() -> Duration {
    DEFAULT_RECORD_TTL
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self { ttl: default_ttl() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Defaults to half the record TTL
    #[serde(default, with = "humantime_serde::option")]
    pub period: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Advertised address; resolved from the environment when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bound on unregistering during shutdown
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: None,
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// What this node registers as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    #[serde(default = "default_component_name")]
    pub name: String,
    #[serde(rename = "type", default = "default_component_type")]
    pub component_type: ComponentType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

fn default_component_name() -> String {
    "meshkit-node".to_owned()
}

fn default_component_type() -> ComponentType {
    ComponentType::Tool
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            name: default_component_name(),
            component_type: default_component_type(),
            description: String::new(),
            version: None,
            capabilities: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Full node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub record: RecordConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub component: ComponentConfig,
}

/// Command-line values that win over every other source.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// `-v` count: 1 info, 2 debug, 3+ trace
    pub verbose: u8,
    pub port: Option<u16>,
    /// Use the in-memory registry
    pub mock: bool,
}

impl MeshConfig {
    /// Figment with defaults, the optional YAML file and the environment layer.
    #[must_use]
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load, apply Kubernetes variables and validate.
    ///
    /// # Errors
    /// - `ConfigError::MissingFile` if `path` does not exist
    /// - `ConfigError::Load` for unparsable sources
    /// - `ConfigError::Invalid`/`Backend` if validation fails
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path
            && !path.is_file()
        {
            return Err(ConfigError::MissingFile(path.to_path_buf()));
        }
        let mut config: Self = Self::figment(path).extract().map_err(Box::new)?;
        config.apply_kubernetes_env();
        config.validate()?;
        Ok(config)
    }

    /// Fill Kubernetes settings from the conventional pod variables.
    pub fn apply_kubernetes_env(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.trim().is_empty())
        }

        if var("KUBERNETES_SERVICE_HOST").is_some() {
            self.kubernetes.enabled = true;
        }
        if let Some(pod) = var("POD_NAME") {
            self.kubernetes.pod_name = Some(pod);
        }
        if let Some(ns) = var("POD_NAMESPACE") {
            self.kubernetes.pod_namespace = Some(ns);
        }
        if let Some(service) = var("SERVICE_NAME") {
            self.kubernetes.service_name = Some(service);
        }
    }

    pub fn apply_cli_overrides(&mut self, cli: &CliOverrides) {
        match cli.verbose {
            0 => {}
            1 => "info".clone_into(&mut self.logging.level),
            2 => "debug".clone_into(&mut self.logging.level),
            _ => "trace".clone_into(&mut self.logging.level),
        }
        if let Some(port) = cli.port {
            self.http.port = port;
        }
        if cli.mock {
            self.discovery.provider = DiscoveryProvider::Mock;
        }
    }

    /// Heartbeat period, defaulting to half the record TTL.
    #[must_use]
    pub fn heartbeat_period(&self) -> Duration {
        self.heartbeat.period.unwrap_or(self.record.ttl / 2)
    }

    #[must_use]
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings::with_ttl(self.record.ttl).with_heartbeat_period(self.heartbeat_period())
    }

    /// # Errors
    /// Returns the first violated constraint. Reserved databases only warn.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery.enabled && self.discovery.provider == DiscoveryProvider::Redis {
            self.backend.connection_url()?;
            check_db(self.backend.db)?;
        }
        if self.record.ttl.is_zero() {
            return Err(ConfigError::Invalid("record.ttl must be positive".into()));
        }
        let period = self.heartbeat_period();
        if period.is_zero() || period >= self.record.ttl {
            return Err(ConfigError::Invalid(format!(
                "heartbeat.period ({}) must be positive and shorter than record.ttl ({})",
                humantime::format_duration(period),
                humantime::format_duration(self.record.ttl)
            )));
        }
        if self.discovery.retry_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "discovery.retry_interval must be positive".into(),
            ));
        }
        if self.http.address.is_some() && self.http.port == 0 {
            return Err(ConfigError::Invalid(
                "http.port must be set when http.address is configured".into(),
            ));
        }
        if self.component.name.trim().is_empty() {
            return Err(ConfigError::Invalid("component.name must not be empty".into()));
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error if the configuration cannot be rendered.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_saphyr::to_string(self)?)
    }
}
