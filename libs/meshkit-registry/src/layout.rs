//! Key layout of the registry.
//!
//! | key                   | value              | TTL   |
//! |-----------------------|--------------------|-------|
//! | `services:<id>`       | JSON record        | `T`   |
//! | `capabilities:<cap>`  | set of service ids | `2·T` |
//! | `names:<name>`        | set of service ids | `2·T` |
//! | `types:<type>`        | set of service ids | `2·T` |
//!
//! Index sets outlive records so a membership never disappears between two
//! heartbeats; ids whose record is gone are filtered out at query time.

use meshkit_backend::Pipeline;
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{RegistryError, Result};
use crate::record::{ComponentType, ServiceRecord};

pub const SERVICES: &str = "services";
pub const CAPABILITIES: &str = "capabilities";
pub const NAMES: &str = "names";
pub const TYPES: &str = "types";

/// Glob matching every record key.
pub const SERVICES_PATTERN: &str = "services:*";

#[must_use]
pub fn service_key(id: &str) -> String {
    format!("{SERVICES}:{id}")
}

#[must_use]
pub fn capability_key(capability: &str) -> String {
    format!("{CAPABILITIES}:{capability}")
}

#[must_use]
pub fn name_key(name: &str) -> String {
    format!("{NAMES}:{name}")
}

#[must_use]
pub fn type_key(component_type: ComponentType) -> String {
    format!("{TYPES}:{component_type}")
}

/// Service id of a record key, if `key` is one.
#[must_use]
pub fn id_from_service_key(key: &str) -> Option<&str> {
    key.strip_prefix(SERVICES)?.strip_prefix(':')
}

/// TTL applied to index sets for a record TTL of `record_ttl`.
#[must_use]
pub fn index_ttl(record_ttl: Duration) -> Duration {
    record_ttl.saturating_mul(2)
}

/// Membership of a service id in one index set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexMembership {
    pub key: String,
    pub member: String,
}

/// # Errors
/// Returns `RegistryError::Serialize` if the metadata cannot be encoded.
pub fn serialize(record: &ServiceRecord) -> Result<String> {
    serde_json::to_string(record).map_err(|source| RegistryError::Serialize {
        id: record.id.clone(),
        source,
    })
}

/// # Errors
/// Returns the JSON error for a value that is not a record.
pub fn deserialize(raw: &str) -> std::result::Result<ServiceRecord, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Index sets `record` belongs to: its type, its name and every capability,
/// internal ones included. Duplicates are collapsed.
#[must_use]
pub fn index_memberships(record: &ServiceRecord) -> Vec<IndexMembership> {
    let keys = std::iter::once(type_key(record.component_type))
        .chain(std::iter::once(name_key(&record.name)))
        .chain(record.capabilities.iter().map(|c| capability_key(&c.name)));

    let mut seen = HashSet::new();
    keys.filter(|k| seen.insert(k.clone()))
        .map(|key| IndexMembership {
            key,
            member: record.id.clone(),
        })
        .collect()
}

/// Memberships in `previous` that `current` no longer has.
#[must_use]
pub fn stale_memberships(
    previous: &[IndexMembership],
    current: &[IndexMembership],
) -> Vec<IndexMembership> {
    let keep: HashSet<&IndexMembership> = current.iter().collect();
    previous
        .iter()
        .filter(|m| !keep.contains(m))
        .cloned()
        .collect()
}

/// One transaction that writes the record, drops `stale` memberships and
/// (re)joins every current index with a refreshed TTL.
///
/// # Errors
/// Returns `RegistryError::Serialize` if the record cannot be encoded.
pub fn write_pipeline(
    record: &ServiceRecord,
    record_ttl: Duration,
    stale: &[IndexMembership],
) -> Result<Pipeline> {
    let mut pipeline = Pipeline::new();
    pipeline.set_with_ttl(service_key(&record.id), serialize(record)?, record_ttl);
    for m in stale {
        pipeline.srem(m.key.clone(), m.member.clone());
    }
    let ttl = index_ttl(record_ttl);
    for m in index_memberships(record) {
        pipeline.sadd(m.key.clone(), m.member).expire(m.key, ttl);
    }
    Ok(pipeline)
}

/// Re-join and refresh the TTL of every index set of `record`.
#[must_use]
pub fn index_refresh_pipeline(record: &ServiceRecord, record_ttl: Duration) -> Pipeline {
    let ttl = index_ttl(record_ttl);
    let mut pipeline = Pipeline::new();
    for m in index_memberships(record) {
        pipeline.sadd(m.key.clone(), m.member).expire(m.key, ttl);
    }
    pipeline
}

/// Delete the record of `id` and leave every index in `memberships`.
#[must_use]
pub fn removal_pipeline(id: &str, memberships: &[IndexMembership]) -> Pipeline {
    let mut pipeline = Pipeline::new();
    pipeline.del(service_key(id));
    for m in memberships {
        pipeline.srem(m.key.clone(), m.member.clone());
    }
    pipeline
}
