//! Typed client for the registry's backing key-value store.
//!
//! [`RegistryBackend`] is the contract; [`RedisBackend`] talks to a real
//! server and [`MockBackend`] keeps everything in memory for tests.

pub mod backend;
pub mod config;
pub mod error;
pub mod keyspace;
pub mod mock;
pub mod pipeline;
pub mod redis_backend;

pub use backend::{BackendConnector, RegistryBackend, Ttl};
pub use config::BackendConfig;
pub use error::{BackendError, ErrorKind, Result};
pub use keyspace::{Keyspace, RedisDb, check_db};
pub use mock::MockBackend;
pub use pipeline::{Command, Pipeline};
pub use redis_backend::{RedisBackend, RedisConnector};
