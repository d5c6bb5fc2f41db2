use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{BackendError, Result};
use crate::keyspace::{Keyspace, MAX_DB, RedisDb};

/// Connection settings for the registry backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    /// Backend URL, e.g. `redis://127.0.0.1:6379`
    #[serde(default = "default_url")]
    pub url: String,

    /// Logical database number (0-15, 7-15 reserved for framework use)
    #[serde(default)]
    pub db: u8,

    /// Prefix applied to every key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Deadline for the initial connection test
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Deadline applied to every individual command
    #[serde(default = "default_op_timeout", with = "humantime_serde")]
    pub op_timeout: Duration,
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_owned()
}

fn default_namespace() -> String {
    "meshkit".to_owned()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_op_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            db: RedisDb::ServiceDiscovery.number(),
            namespace: default_namespace(),
            connect_timeout: default_connect_timeout(),
            op_timeout: default_op_timeout(),
        }
    }
}

impl BackendConfig {
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn with_db(mut self, db: RedisDb) -> Self {
        self.db = db.number();
        self
    }

    #[must_use]
    pub fn keyspace(&self) -> Keyspace {
        Keyspace::new(self.namespace.clone())
    }

    /// Validate the URL and database number, returning the URL that should be
    /// dialled (with the database number applied as its path).
    ///
    /// # Errors
    /// Returns `BackendError::Config` for malformed URLs, unsupported schemes
    /// or an out-of-range database.
    pub fn connection_url(&self) -> Result<url::Url> {
        if self.db > MAX_DB {
            return Err(BackendError::Config(format!(
                "database {} is out of range (0-{MAX_DB})",
                self.db
            )));
        }
        let mut url = url::Url::parse(&self.url)
            .map_err(|e| BackendError::Config(format!("invalid backend url '{}': {e}", self.url)))?;
        match url.scheme() {
            "redis" | "rediss" => {}
            other => {
                return Err(BackendError::Config(format!(
                    "unsupported backend url scheme '{other}'"
                )));
            }
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(BackendError::Config(format!(
                "backend url '{}' has no host",
                self.url
            )));
        }
        url.set_path(&format!("/{}", self.db));
        Ok(url)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = BackendConfig::default();
        assert_eq!(cfg.url, "redis://127.0.0.1:6379");
        assert_eq!(cfg.db, 0);
        assert_eq!(cfg.namespace, "meshkit");
        assert_eq!(cfg.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn durations_parse_humantime() {
        let cfg: BackendConfig =
            serde_json::from_str(r#"{"url":"redis://r:6379","op_timeout":"250ms"}"#).unwrap();
        assert_eq!(cfg.op_timeout, Duration::from_millis(250));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn connection_url_applies_db() {
        let cfg = BackendConfig {
            db: 3,
            ..BackendConfig::default()
        };
        assert_eq!(cfg.connection_url().unwrap().as_str(), "redis://127.0.0.1:6379/3");
    }

    #[test]
    fn malformed_urls_are_config_errors() {
        for bad in ["not a url", "http://localhost:6379", "redis://"] {
            let cfg = BackendConfig::default().with_url(bad);
            assert!(
                matches!(cfg.connection_url(), Err(BackendError::Config(_))),
                "expected config error for {bad}"
            );
        }
    }

    #[test]
    fn out_of_range_db_is_config_error() {
        let cfg = BackendConfig {
            db: 16,
            ..BackendConfig::default()
        };
        assert!(matches!(cfg.connection_url(), Err(BackendError::Config(_))));
    }
}
