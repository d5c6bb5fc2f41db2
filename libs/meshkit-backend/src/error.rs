//! Backend error types and the error-kind taxonomy shared by all meshkit crates.

use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a failure, used to pick a retry policy.
///
/// - `Config`: fatal, surfaced to the caller.
/// - `Connection`: surfaced from registration; turned into retry mode when enabled.
/// - `NotFound`: empty result in discovery, ignored in unregister.
/// - `Transient`: logged and swallowed by background loops.
/// - `Fatal`: surfaced, nothing is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Connection,
    NotFound,
    Transient,
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Connection => "connection",
            Self::NotFound => "not_found",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Errors produced by a registry backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid backend configuration: {0}")]
    Config(String),

    #[error("backend unreachable during {op}: {message}")]
    Connection { op: &'static str, message: String },

    #[error("backend {op} timed out after {}ms", after.as_millis())]
    Timeout { op: &'static str, after: Duration },

    #[error("backend {op} failed: {message}")]
    Command { op: &'static str, message: String },

    #[error("backend client is closed")]
    Closed,
}

impl BackendError {
    #[must_use]
    pub fn connection(op: &'static str, message: impl Into<String>) -> Self {
        Self::Connection {
            op,
            message: message.into(),
        }
    }

    /// Classify a Redis client error.
    ///
    /// Transport level faults (refused, dropped, IO, client-side timeouts) are
    /// `Connection`; anything the server answered with is `Command`.
    #[must_use]
    pub fn from_redis(op: &'static str, err: &redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            Self::connection(op, err.to_string())
        } else {
            Self::Command {
                op,
                message: err.to_string(),
            }
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Connection { .. } | Self::Timeout { .. } | Self::Closed => ErrorKind::Connection,
            Self::Command { .. } => ErrorKind::Transient,
        }
    }

    #[must_use]
    pub fn is_connection(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }
}

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(
            BackendError::Config("bad url".to_owned()).kind(),
            ErrorKind::Config
        );
        assert_eq!(
            BackendError::connection("PING", "refused").kind(),
            ErrorKind::Connection
        );
        assert_eq!(
            BackendError::Timeout {
                op: "GET",
                after: Duration::from_secs(5)
            }
            .kind(),
            ErrorKind::Connection
        );
        assert_eq!(BackendError::Closed.kind(), ErrorKind::Connection);
        assert_eq!(
            BackendError::Command {
                op: "SADD",
                message: "WRONGTYPE".to_owned()
            }
            .kind(),
            ErrorKind::Transient
        );
    }

    #[test]
    fn io_errors_classify_as_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = BackendError::from_redis("PING", &redis::RedisError::from(io));
        assert!(err.is_connection());
    }
}
