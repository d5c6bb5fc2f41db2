//! Tracing subscriber setup.

use anyhow::Context as _;
use meshkit_registry::ComponentType;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_level() -> String {
    "info".to_owned()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    /// `RUST_LOG` if set, otherwise the configured level.
    ///
    /// # Errors
    /// Returns an error if the configured level is not a valid directive.
    pub fn env_filter(&self) -> anyhow::Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .with_context(|| format!("invalid log level '{}'", self.level)),
        }
    }
}

/// Install the global subscriber and return the root span of the process.
///
/// The component kind and name are passed in explicitly and recorded on the
/// root span, so every event emitted inside it carries them.
///
/// # Errors
/// Returns an error for an invalid level or if a global subscriber is
/// already installed.
pub fn init_logging(
    config: &LoggingConfig,
    component_type: ComponentType,
    component_name: &str,
) -> anyhow::Result<tracing::Span> {
    let filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .try_init(),
    }
    .context("failed to install tracing subscriber")?;

    Ok(tracing::info_span!(
        "component",
        component_type = %component_type,
        component = %component_name
    ))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn configured_level_is_used_without_rust_log() {
        temp_env::with_var_unset("RUST_LOG", || {
            let cfg = LoggingConfig {
                level: "meshkit=debug,warn".into(),
                format: LogFormat::Json,
            };
            let filter = cfg.env_filter().unwrap();
            assert!(filter.to_string().contains("meshkit=debug"));
        });
    }

    #[test]
    fn invalid_level_is_rejected() {
        temp_env::with_var_unset("RUST_LOG", || {
            let cfg = LoggingConfig {
                level: "meshkit=[".into(),
                format: LogFormat::Text,
            };
            assert!(cfg.env_filter().is_err());
        });
    }

    #[test]
    fn format_parses_snake_case() {
        let cfg: LoggingConfig = serde_json::from_str(r#"{"format":"json"}"#).unwrap();
        assert_eq!(cfg.format, LogFormat::Json);
        assert_eq!(cfg.level, "info");
    }
}
