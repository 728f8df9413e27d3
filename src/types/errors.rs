//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Run-time faults raised by executing work
//! are not errors of this type; see [`crate::kernel::Fault`].

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the floor kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed configuration detected while building the kernel.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Named item not found (office, function, team, source).
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid lifecycle transition (kernel, team, pool).
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Timeout waiting on the kernel.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Whether this error was raised while resolving configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_format_messages() {
        assert_eq!(
            Error::configuration("missing team").to_string(),
            "configuration error: missing team"
        );
        assert_eq!(Error::not_found("office").to_string(), "not found: office");
        assert!(Error::configuration("x").is_configuration());
        assert!(!Error::internal("x").is_configuration());
    }

    #[test]
    fn test_serde_error_converts() {
        let err: Error = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
