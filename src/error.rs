//! Unified error handling for Conductor.

use std::fmt;

/// Error types shared across the proxy system.
///
/// HTTP-visible failures (`no_matching_mount_point`, `no_healthy_backends`)
/// are response bodies rather than error values and never appear here.
#[derive(Debug)]
pub enum ConductorError {
    /// The registry could not be reached or returned an unusable response.
    /// Transient: callers back off and retry.
    Registry(String),

    /// A mount point was installed twice. The supervisor is the only route
    /// writer, so this is a programmer error and fatal.
    AlreadyRegistered(String),

    /// Invalid configuration detected at startup.
    Config(String),
}

impl ConductorError {
    pub fn registry<E: fmt::Display>(context: &str, err: E) -> Self {
        ConductorError::Registry(format!("{context}: {err}"))
    }
}

impl fmt::Display for ConductorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConductorError::Registry(msg) => write!(f, "registry unavailable: {msg}"),
            ConductorError::AlreadyRegistered(mount) => {
                write!(f, "mount point already registered: {mount}")
            }
            ConductorError::Config(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for ConductorError {}

/// Result type alias for conductor operations.
pub type ConductorResult<T> = std::result::Result<T, ConductorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = ConductorError::registry("listing services", "connection refused");
        assert_eq!(
            err.to_string(),
            "registry unavailable: listing services: connection refused"
        );

        let err = ConductorError::AlreadyRegistered("/solr".to_string());
        assert_eq!(err.to_string(), "mount point already registered: /solr");
    }
}
