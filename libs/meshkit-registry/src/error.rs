use meshkit_backend::{BackendError, ErrorKind};
use thiserror::Error;

/// Errors surfaced by registration and discovery.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("invalid service record: {0}")]
    InvalidRecord(String),

    #[error("malformed record stored at '{key}'")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize record '{id}'")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("service '{0}' is not registered")]
    NotFound(String),
}

impl RegistryError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Backend(e) => e.kind(),
            Self::InvalidRecord(_) | Self::Malformed { .. } | Self::Serialize { .. } => {
                ErrorKind::Fatal
            }
            Self::NotFound(_) => ErrorKind::NotFound,
        }
    }

    /// `true` when the backend could not be reached; the caller may retry later.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn backend_kinds_pass_through() {
        let err: RegistryError = BackendError::connection("PING", "refused").into();
        assert!(err.is_connection());
        let err: RegistryError = BackendError::Config("bad url".into()).into();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn record_problems_are_fatal() {
        assert_eq!(
            RegistryError::InvalidRecord("port 0".into()).kind(),
            ErrorKind::Fatal
        );
        assert_eq!(
            RegistryError::NotFound("svc".into()).kind(),
            ErrorKind::NotFound
        );
    }
}
