//! Components that publish themselves in a shared service registry.
//!
//! A [`Tool`] registers and heartbeats; an [`Agent`] additionally discovers
//! other components. When the registry is unreachable at start, components
//! keep running and register in the background.
//!
//! ```no_run
//! use meshkit::{Component, Tool};
//! use meshkit_bootstrap::MeshConfig;
//! use meshkit_registry::Capability;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = MeshConfig::load(None)?;
//! let mut tool = Tool::new("weather").with_capability(Capability::new("forecast"));
//! tool.configure(&config)?;
//! tool.start(CancellationToken::new()).await?;
//! // serve requests...
//! tool.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod component;
pub mod error;
mod node;
pub mod slot;

pub use component::{Agent, Component, Tool};
pub use error::{ComponentError, Result};
pub use node::local_registry;
pub use slot::{InstallHandle, RegistrationSlot, RegistrationState};
