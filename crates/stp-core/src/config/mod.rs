//! Configuration management for stp

mod broker;
mod client;
pub mod serde_utils;

pub use broker::{BrokerConfig, EmbeddedSshConfig};
pub use client::{BackoffConfig, ClientConfig};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stp")
}

/// Load configuration from a TOML file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Home directory of a local user, following the usual platform layout
pub(crate) fn user_home(user: &str) -> PathBuf {
    if user == "root" {
        PathBuf::from("/root")
    } else if cfg!(target_os = "macos") {
        PathBuf::from("/Users").join(user)
    } else {
        PathBuf::from("/home").join(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_missing_file() {
        let result = load_config::<BrokerConfig>(Path::new("/nonexistent/stp/broker.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"auth_key = "s3cret""#).unwrap();
        writeln!(file, r#"port_range = "9000-9001""#).unwrap();

        let config: BrokerConfig = load_config(file.path()).unwrap();
        assert_eq!(config.auth_key, "s3cret");
        assert_eq!(config.port_range.len(), 2);
        assert_eq!(config.listen_address, BrokerConfig::default().listen_address);
    }

    #[test]
    fn test_load_rejects_bad_port_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"port_range = "9001-9000""#).unwrap();

        let result = load_config::<BrokerConfig>(file.path());
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_user_home() {
        assert_eq!(user_home("root"), PathBuf::from("/root"));
        assert!(user_home("alice").ends_with("alice"));
    }
}
