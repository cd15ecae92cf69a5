//! Core error types for stp

use std::path::PathBuf;

use thiserror::Error;

/// Configuration-related errors
///
/// All of these are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Port range is malformed or unusable
    #[error("Invalid port range {range:?}: {reason}")]
    InvalidPortRange { range: String, reason: String },

    /// Endpoint is not `host:port`
    #[error("Invalid endpoint {0:?}: expected host:port")]
    InvalidEndpoint(String),

    /// SSH key material could not be read or parsed
    #[error("Failed to load SSH key from {path:?}: {reason}")]
    KeyMaterial { path: PathBuf, reason: String },

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_message() {
        let err = ConfigError::MissingField("auth_key".to_string());
        assert_eq!(err.to_string(), "Missing required field: auth_key");
    }

    #[test]
    fn test_key_material_message_names_path() {
        let err = ConfigError::KeyMaterial {
            path: PathBuf::from("/root/.ssh/id_rsa"),
            reason: "No such file or directory".to_string(),
        };
        assert!(err.to_string().contains("/root/.ssh/id_rsa"));
    }
}
