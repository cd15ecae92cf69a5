//! Broker configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::seconds;
use crate::error::ConfigError;
use crate::types::{Endpoint, PortRange};

/// Configuration for the broker daemon
///
/// Built once at startup and shared by reference with every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Shared secret every client must present at login
    pub auth_key: String,

    /// Address of the control channel and operator listing (HTTP/WebSocket)
    pub listen_address: String,

    /// SSH endpoint advertised to clients (`host:port`)
    pub ssh_address: String,

    /// User clients authenticate as on the SSH endpoint
    pub ssh_user: String,

    /// Private key handed to clients; the public half is read from `<path>.pub`.
    /// Defaults to `~<ssh_user>/.ssh/id_rsa`.
    pub ssh_key_path: Option<PathBuf>,

    /// Ports that may be assigned to clients
    pub port_range: PortRange,

    /// Interval between liveness sweeps
    #[serde(with = "seconds")]
    pub check_interval: Duration,

    /// Connect timeout of a single port probe
    #[serde(with = "seconds")]
    pub probe_timeout: Duration,

    /// Serve the SSH endpoint in-process instead of relying on a system sshd
    pub ssh_server: Option<EmbeddedSshConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            auth_key: "tunnelkey".to_string(),
            listen_address: "0.0.0.0:10000".to_string(),
            ssh_address: "127.0.0.1:22".to_string(),
            ssh_user: "root".to_string(),
            ssh_key_path: None,
            port_range: PortRange::new(20000, 20099).expect("default port range is valid"),
            check_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
            ssh_server: None,
        }
    }
}

impl BrokerConfig {
    /// Path of the private key handed to clients
    pub fn private_key_path(&self) -> PathBuf {
        self.ssh_key_path.clone().unwrap_or_else(|| {
            super::user_home(&self.ssh_user)
                .join(".ssh")
                .join("id_rsa")
        })
    }

    /// Path of the matching public key
    pub fn public_key_path(&self) -> PathBuf {
        let mut path = self.private_key_path().into_os_string();
        path.push(".pub");
        PathBuf::from(path)
    }

    /// Check the fields that cannot be validated while deserializing
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth_key.is_empty() {
            return Err(ConfigError::MissingField("auth_key".to_string()));
        }
        if self.ssh_user.is_empty() {
            return Err(ConfigError::MissingField("ssh_user".to_string()));
        }
        self.ssh_address.parse::<Endpoint>()?;
        if self.check_interval.is_zero() {
            return Err(ConfigError::Invalid("check_interval must be positive".to_string()));
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::Invalid("probe_timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// In-process SSH endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddedSshConfig {
    /// Address the SSH endpoint listens on
    pub bind_address: String,

    /// Host key of the endpoint; generated in memory when the file is missing
    pub host_key_path: PathBuf,
}

impl Default for EmbeddedSshConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:2222".to_string(),
            host_key_path: super::default_config_dir().join("host_key"),
        }
    }
}
