//! Address and id resolution for registered components.
//!
//! The same resolver feeds the registry record and the advertised health
//! endpoint so both always point at the same place.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Orchestrator deployment settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_namespace: Option<String>,
    /// Port the cluster service exposes
    #[serde(default = "default_service_port")]
    pub service_port: u16,
}

fn default_service_port() -> u16 {
    80
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: None,
            pod_name: None,
            pod_namespace: None,
            service_port: default_service_port(),
        }
    }
}

impl KubernetesConfig {
    /// Service name when orchestrator mode is on and one is declared.
    #[must_use]
    pub fn stable_name(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.service_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        self.pod_namespace
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or("default")
    }
}

/// Where callers reach a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAddress {
    pub host: String,
    pub port: u16,
}

impl ResolvedAddress {
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url())
    }
}

/// Resolve the advertised address.
///
/// Precedence: cluster service DNS name when orchestrator mode is on, then
/// the configured address, then the machine hostname, then `localhost`.
#[must_use]
pub fn resolve_address(
    kubernetes: &KubernetesConfig,
    address: Option<&str>,
    port: u16,
) -> ResolvedAddress {
    if let Some(service) = kubernetes.stable_name() {
        return ResolvedAddress {
            host: format!("{service}.{}.svc.cluster.local", kubernetes.namespace()),
            port: kubernetes.service_port,
        };
    }

    if let Some(address) = address.map(str::trim).filter(|a| !a.is_empty()) {
        return ResolvedAddress {
            host: address.to_owned(),
            port,
        };
    }

    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_owned());
    ResolvedAddress { host, port }
}

/// Registration id: the service name in orchestrator mode, so replicas share
/// one slot, otherwise `<name>-<8 hex digits>`.
#[must_use]
pub fn service_id(name: &str, kubernetes: &KubernetesConfig) -> String {
    if let Some(service) = kubernetes.stable_name() {
        return service.to_owned();
    }
    let suffix = uuid::Uuid::new_v4().as_fields().0;
    format!("{name}-{suffix:08x}")
}

/// Deployment facts worth publishing as record metadata.
#[must_use]
pub fn deployment_metadata(kubernetes: &KubernetesConfig) -> BTreeMap<String, Value> {
    let mut metadata = BTreeMap::new();
    if !kubernetes.enabled {
        return metadata;
    }
    metadata.insert("namespace".to_owned(), Value::from(kubernetes.namespace()));
    if let Some(pod) = &kubernetes.pod_name {
        metadata.insert("pod_name".to_owned(), Value::from(pod.as_str()));
    }
    if let Some(service) = &kubernetes.service_name {
        metadata.insert("service_name".to_owned(), Value::from(service.as_str()));
    }
    metadata
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn k8s(service: &str) -> KubernetesConfig {
        KubernetesConfig {
            enabled: true,
            service_name: Some(service.to_owned()),
            pod_name: Some(format!("{service}-0")),
            pod_namespace: Some("tools".to_owned()),
            ..KubernetesConfig::default()
        }
    }

    #[test]
    fn cluster_name_wins() {
        let addr = resolve_address(&k8s("weather"), Some("10.0.0.1"), 8080);
        assert_eq!(addr.host, "weather.tools.svc.cluster.local");
        assert_eq!(addr.port, 80);
        assert_eq!(
            addr.health_url(),
            "http://weather.tools.svc.cluster.local:80/health"
        );
    }

    #[test]
    fn configured_address_then_hostname() {
        let off = KubernetesConfig::default();
        let addr = resolve_address(&off, Some("10.0.0.1"), 8080);
        assert_eq!(addr.host, "10.0.0.1");
        assert_eq!(addr.port, 8080);

        let addr = resolve_address(&off, Some("  "), 8080);
        assert!(!addr.host.is_empty());
        assert_eq!(addr.port, 8080);
    }

    #[test]
    fn disabled_cluster_settings_are_ignored() {
        let mut cfg = k8s("weather");
        cfg.enabled = false;
        assert_eq!(resolve_address(&cfg, Some("a"), 1).host, "a");
        assert!(deployment_metadata(&cfg).is_empty());
    }

    #[test]
    fn stable_and_ephemeral_ids() {
        assert_eq!(service_id("weather", &k8s("weather")), "weather");

        let id = service_id("weather", &KubernetesConfig::default());
        let suffix = id.strip_prefix("weather-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, service_id("weather", &KubernetesConfig::default()));
    }

    #[test]
    fn metadata_from_deployment() {
        let meta = deployment_metadata(&k8s("weather"));
        assert_eq!(meta["namespace"], "tools");
        assert_eq!(meta["pod_name"], "weather-0");
        assert_eq!(meta["service_name"], "weather");
    }
}
