//! Host bootstrap: layered configuration, logging initialisation and OS
//! signal handling.

pub mod config;
pub mod logging;
pub mod signals;

pub use config::{
    CliOverrides, ComponentConfig, ConfigError, DiscoveryConfig, DiscoveryProvider, ENV_PREFIX,
    HeartbeatConfig, HttpConfig, MeshConfig, RecordConfig,
};
pub use logging::{LogFormat, LoggingConfig, init_logging};
pub use signals::{ShutdownSignal, shutdown_token, wait_for_shutdown};
