use thiserror::Error;

/// Errors that can occur in the configuration node library
#[derive(Error, Debug)]
pub enum ConfigNodeError {
    /// Coordination service unreachable after the retry budget
    #[error("Coordination service unreachable after {attempts} attempts: {message}")]
    Connection { attempts: u32, message: String },

    /// Operation targets a node that does not exist
    #[error("Node not found: {0}")]
    NotFound(String),

    /// Create targets a node that already exists
    #[error("Node already exists: {0}")]
    AlreadyExists(String),

    /// Delete targets a node that still has children
    #[error("Node has children: {0}")]
    NotEmpty(String),

    /// A single value could not be read during a bulk listing
    #[error("Transient read error at {path}: {message}")]
    TransientRead { path: String, message: String },

    /// Stored value is not boolean-parseable
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Malformed coordination path or path segment
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Rule regex rejected before reaching the coordination service
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// Coordination call exceeded the configured call timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Opaque failure reported by the coordination backend
    #[error("Coordination backend error: {0}")]
    Backend(String),

    /// Node configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The client or service has been shut down
    #[error("Coordination client is closed")]
    Closed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using ConfigNodeError
pub type Result<T> = std::result::Result<T, ConfigNodeError>;

impl ConfigNodeError {
    /// Whether the error means the target node is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConfigNodeError::NotFound(_))
    }

    /// Operation label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigNodeError::Connection { .. } => "connection",
            ConfigNodeError::NotFound(_) => "not_found",
            ConfigNodeError::AlreadyExists(_) => "already_exists",
            ConfigNodeError::NotEmpty(_) => "not_empty",
            ConfigNodeError::TransientRead { .. } => "transient_read",
            ConfigNodeError::Serialization(_) => "serialization",
            ConfigNodeError::InvalidPath(_) => "invalid_path",
            ConfigNodeError::InvalidRule(_) => "invalid_rule",
            ConfigNodeError::Timeout(_) => "timeout",
            ConfigNodeError::Backend(_) => "backend",
            ConfigNodeError::Config(_) => "config",
            ConfigNodeError::Closed => "closed",
            ConfigNodeError::Io(_) => "io",
        }
    }
}

impl From<config::ConfigError> for ConfigNodeError {
    fn from(err: config::ConfigError) -> Self {
        ConfigNodeError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigNodeError {
    fn from(err: serde_json::Error) -> Self {
        ConfigNodeError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigNodeError::NotFound("/waf/config/request/ip-filter".to_string());
        assert_eq!(err.to_string(), "Node not found: /waf/config/request/ip-filter");
    }

    #[test]
    fn test_connection_error_display() {
        let err = ConfigNodeError::Connection {
            attempts: 4,
            message: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Coordination service unreachable after 4 attempts: connection refused"
        );
        assert_eq!(err.kind(), "connection");
    }

    #[test]
    fn test_is_not_found() {
        assert!(ConfigNodeError::NotFound("/a".into()).is_not_found());
        assert!(!ConfigNodeError::AlreadyExists("/a".into()).is_not_found());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ConfigNodeError = io_err.into();
        assert!(matches!(err, ConfigNodeError::Io(_)));
    }
}
