use meshkit_backend::ErrorKind;
use meshkit_bootstrap::ConfigError;
use meshkit_registry::RegistryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComponentError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("component '{0}' is already started")]
    AlreadyStarted(String),

    #[error("component '{0}' has been shut down")]
    Terminated(String),
}

impl ComponentError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Registry(e) => e.kind(),
            Self::Config(e) => e.kind(),
            Self::AlreadyStarted(_) | Self::Terminated(_) => ErrorKind::Fatal,
        }
    }
}

impl From<meshkit_backend::BackendError> for ComponentError {
    fn from(e: meshkit_backend::BackendError) -> Self {
        Self::Registry(e.into())
    }
}

pub type Result<T> = std::result::Result<T, ComponentError>;
