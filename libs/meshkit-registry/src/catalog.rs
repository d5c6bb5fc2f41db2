//! Capability listing handed to orchestrating agents.
//!
//! Internal capabilities stay discoverable by explicit query but never
//! appear here.

use serde::Serialize;
use std::fmt::{self, Write as _};

use crate::record::{Capability, ComponentType, ServiceRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    pub base_url: String,
    pub capabilities: Vec<Capability>,
}

/// Deterministically ordered listing (by name, then id).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Catalog {
    pub entries: Vec<CatalogEntry>,
}

/// Build the catalog for `records`. Records without a visible capability are
/// still listed.
#[must_use]
pub fn catalog(records: &[ServiceRecord]) -> Catalog {
    let mut entries: Vec<CatalogEntry> = records
        .iter()
        .map(|r| CatalogEntry {
            id: r.id.clone(),
            name: r.name.clone(),
            component_type: r.component_type,
            base_url: r.base_url(),
            capabilities: r.public_capabilities().cloned().collect(),
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    Catalog { entries }
}

impl Catalog {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Plain-text listing suitable for a model prompt.
    #[must_use]
    pub fn to_prompt(&self) -> String {
        self.to_string()
    }

    /// Whether `capability` is listed for any entry.
    #[must_use]
    pub fn lists(&self, capability: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.capabilities.iter().any(|c| c.name == capability))
    }
}

fn join_types(types: &[String]) -> String {
    if types.is_empty() {
        "any".to_owned()
    } else {
        types.join(", ")
    }
}

impl fmt::Display for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return writeln!(f, "No components available.");
        }
        for entry in &self.entries {
            writeln!(
                f,
                "{} '{}' ({}) at {}",
                entry.component_type, entry.name, entry.id, entry.base_url
            )?;
            if entry.capabilities.is_empty() {
                writeln!(f, "  (no public capabilities)")?;
            }
            for cap in &entry.capabilities {
                let mut line = format!("  - {}", cap.name);
                if !cap.description.is_empty() {
                    write!(line, ": {}", cap.description)?;
                }
                writeln!(f, "{line}")?;
                writeln!(f, "    endpoint: {}", cap.endpoint)?;
                writeln!(
                    f,
                    "    input: {}; output: {}",
                    join_types(&cap.input_types),
                    join_types(&cap.output_types)
                )?;
                for hint in &cap.input_summary {
                    let required = if hint.required { "required" } else { "optional" };
                    writeln!(
                        f,
                        "    field {} ({}, {required}){}",
                        hint.name,
                        hint.field_type,
                        if hint.description.is_empty() {
                            String::new()
                        } else {
                            format!(": {}", hint.description)
                        }
                    )?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::record::FieldHint;

    #[test]
    fn internal_capabilities_are_hidden() {
        let planner = ServiceRecord::agent("svc-D", "planner", "10.0.0.9", 9000)
            .with_capability(Capability::new("plan").internal())
            .with_capability(
                Capability::new("chat")
                    .with_description("Talk to the planner")
                    .with_input_types(["text"])
                    .with_input_summary(vec![FieldHint::new("message", "string").required()]),
            );
        let only_internal = ServiceRecord::tool("svc-E", "hidden", "h", 1)
            .with_capability(Capability::new("secret").internal());

        let cat = catalog(&[planner, only_internal]);
        assert!(cat.lists("chat"));
        assert!(!cat.lists("plan"));
        assert_eq!(cat.entries.len(), 2);
        assert_eq!(cat.entries[0].name, "hidden");

        let text = cat.to_prompt();
        assert!(text.contains("agent 'planner' (svc-D) at http://10.0.0.9:9000"));
        assert!(text.contains("  - chat: Talk to the planner"));
        assert!(text.contains("field message (string, required)"));
        assert!(text.contains("(no public capabilities)"));
        assert!(!text.contains("plan:"));
        assert!(!text.contains("secret"));
    }

    #[test]
    fn empty_catalog_text() {
        assert_eq!(catalog(&[]).to_prompt(), "No components available.\n");
    }
}
