//! Service record schema.
//!
//! Records are stored as JSON with snake_case keys. Empty optional fields are
//! omitted and unknown fields are ignored on read, so newer writers stay
//! readable by older readers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{RegistryError, Result};

/// Kind of registered component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Tool,
    Agent,
}

impl ComponentType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Agent => "agent",
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentType {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tool" => Ok(Self::Tool),
            "agent" => Ok(Self::Agent),
            other => Err(RegistryError::InvalidRecord(format!(
                "unknown component type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

/// Short description of one input or output field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldHint {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl FieldHint {
    #[must_use]
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            required: false,
            description: String::new(),
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !*b
}

/// A named HTTP-invocable operation offered by a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_summary: Vec<FieldHint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_summary: Vec<FieldHint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_endpoint: Option<String>,
    /// Hidden from orchestration catalogs; still indexed and callable.
    #[serde(default, skip_serializing_if = "is_false")]
    pub internal: bool,
}

impl Capability {
    /// Capability served at `/api/capabilities/<name>`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let endpoint = format!("/api/capabilities/{name}");
        Self {
            name,
            description: String::new(),
            endpoint,
            input_types: Vec::new(),
            output_types: Vec::new(),
            input_summary: Vec::new(),
            output_summary: Vec::new(),
            schema_endpoint: None,
            internal: false,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    #[must_use]
    pub fn with_input_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_types = types.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_output_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_types = types.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_input_summary(mut self, fields: Vec<FieldHint>) -> Self {
        self.input_summary = fields;
        self
    }

    #[must_use]
    pub fn with_output_summary(mut self, fields: Vec<FieldHint>) -> Self {
        self.output_summary = fields;
        self
    }

    #[must_use]
    pub fn with_schema_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.schema_endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

/// The unit of registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub health: HealthStatus,
    pub last_seen: DateTime<Utc>,
}

impl ServiceRecord {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        component_type: ComponentType,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            component_type,
            address: address.into(),
            port,
            capabilities: Vec::new(),
            metadata: BTreeMap::new(),
            health: HealthStatus::Unknown,
            last_seen: Utc::now(),
        }
    }

    #[must_use]
    pub fn tool(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self::new(id, name, ComponentType::Tool, address, port)
    }

    #[must_use]
    pub fn agent(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self::new(id, name, ComponentType::Agent, address, port)
    }

    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }

    #[must_use]
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }

    /// Capabilities shown to orchestrators.
    pub fn public_capabilities(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter().filter(|c| !c.internal)
    }

    /// `http://<address>:<port>`
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }

    /// Check the record can be registered.
    ///
    /// # Errors
    /// Returns `RegistryError::InvalidRecord` for an empty id, name or address,
    /// port 0, or duplicate capability names.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(RegistryError::InvalidRecord("id must not be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(RegistryError::InvalidRecord(format!(
                "service '{}' has an empty name",
                self.id
            )));
        }
        if self.address.trim().is_empty() {
            return Err(RegistryError::InvalidRecord(format!(
                "service '{}' has an empty address",
                self.id
            )));
        }
        if self.port == 0 {
            return Err(RegistryError::InvalidRecord(format!(
                "service '{}' has port 0",
                self.id
            )));
        }
        let mut seen = HashSet::new();
        for cap in &self.capabilities {
            if cap.name.trim().is_empty() {
                return Err(RegistryError::InvalidRecord(format!(
                    "service '{}' has a capability without a name",
                    self.id
                )));
            }
            if !seen.insert(cap.name.as_str()) {
                return Err(RegistryError::InvalidRecord(format!(
                    "service '{}' declares capability '{}' twice",
                    self.id, cap.name
                )));
            }
        }
        Ok(())
    }
}
