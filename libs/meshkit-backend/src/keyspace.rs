//! Key namespacing and logical database catalog.

use crate::error::{BackendError, Result};

/// Highest logical database number a Redis server exposes by default.
pub const MAX_DB: u8 = 15;

/// First database number reserved for framework use.
pub const FIRST_RESERVED_DB: u8 = 7;

/// Logical databases used by the framework, one per concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedisDb {
    ServiceDiscovery,
    RateLimiting,
    Sessions,
    Cache,
    CircuitBreaker,
    Metrics,
    Telemetry,
    Tasks,
}

impl RedisDb {
    pub const ALL: [Self; 8] = [
        Self::ServiceDiscovery,
        Self::RateLimiting,
        Self::Sessions,
        Self::Cache,
        Self::CircuitBreaker,
        Self::Metrics,
        Self::Telemetry,
        Self::Tasks,
    ];

    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::ServiceDiscovery => 0,
            Self::RateLimiting => 1,
            Self::Sessions => 2,
            Self::Cache => 3,
            Self::CircuitBreaker => 4,
            Self::Metrics => 5,
            Self::Telemetry => 6,
            Self::Tasks => 7,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ServiceDiscovery => "service-discovery",
            Self::RateLimiting => "rate-limiting",
            Self::Sessions => "sessions",
            Self::Cache => "cache",
            Self::CircuitBreaker => "circuit-breaker",
            Self::Metrics => "metrics",
            Self::Telemetry => "telemetry",
            Self::Tasks => "tasks",
        }
    }

    #[must_use]
    pub fn from_number(db: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.number() == db)
    }

    /// `true` for databases 7..=15.
    #[must_use]
    pub const fn is_reserved(db: u8) -> bool {
        db >= FIRST_RESERVED_DB && db <= MAX_DB
    }
}

/// Validate a requested database number.
///
/// Reserved numbers are allowed but logged, so application data does not
/// silently land in a framework database.
///
/// # Errors
/// Returns `BackendError::Config` when `db` is above [`MAX_DB`].
pub fn check_db(db: u8) -> Result<()> {
    if db > MAX_DB {
        return Err(BackendError::Config(format!(
            "database {db} is out of range (0-{MAX_DB})"
        )));
    }
    if RedisDb::is_reserved(db) {
        let owner = RedisDb::from_number(db).map_or("framework", RedisDb::name);
        tracing::warn!(
            db,
            owner,
            "database {db} is reserved for framework use ({FIRST_RESERVED_DB}-{MAX_DB}); \
             application data may collide"
        );
    }
    Ok(())
}

/// Prefixes every key with `<namespace>:` so several deployments can share a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    namespace: String,
}

impl Keyspace {
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Full key for a logical key. An empty namespace leaves keys untouched.
    #[must_use]
    pub fn key(&self, logical: &str) -> String {
        if self.namespace.is_empty() {
            logical.to_owned()
        } else {
            format!("{}:{logical}", self.namespace)
        }
    }

    #[must_use]
    pub fn keys(&self, logical: &[String]) -> Vec<String> {
        logical.iter().map(|k| self.key(k)).collect()
    }

    /// Inverse of [`Keyspace::key`]; `None` when the key belongs to another namespace.
    #[must_use]
    pub fn strip<'a>(&self, full: &'a str) -> Option<&'a str> {
        if self.namespace.is_empty() {
            return Some(full);
        }
        full.strip_prefix(self.namespace.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed_with_namespace() {
        let ks = Keyspace::new("prod");
        assert_eq!(ks.key("services:svc-a"), "prod:services:svc-a");
        assert_eq!(ks.strip("prod:services:svc-a"), Some("services:svc-a"));
        assert_eq!(ks.strip("staging:services:svc-a"), None);
        assert_eq!(ks.strip("production:services:svc-a"), None);
    }

    #[test]
    fn empty_namespace_is_identity() {
        let ks = Keyspace::new("");
        assert_eq!(ks.key("types:tool"), "types:tool");
        assert_eq!(ks.strip("types:tool"), Some("types:tool"));
    }

    #[test]
    fn db_catalog_numbers_are_distinct() {
        let mut numbers: Vec<u8> = RedisDb::ALL.iter().map(|d| d.number()).collect();
        numbers.dedup();
        assert_eq!(numbers.len(), RedisDb::ALL.len());
        assert_eq!(RedisDb::from_number(0), Some(RedisDb::ServiceDiscovery));
        assert_eq!(RedisDb::from_number(12), None);
    }

    #[test]
    fn reserved_db_is_warned_not_rejected() {
        assert!(check_db(0).is_ok());
        assert!(check_db(9).is_ok());
        assert!(RedisDb::is_reserved(9));
        assert!(!RedisDb::is_reserved(6));
        assert!(matches!(check_db(16), Err(BackendError::Config(_))));
    }
}
