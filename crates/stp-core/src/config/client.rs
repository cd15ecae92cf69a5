//! Client configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::seconds;
use crate::types::Endpoint;

/// Configuration for the tunnel client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name reported at login, defaults to the hostname
    pub name: String,

    /// Control channel URL of the broker
    pub server_url: String,

    /// Host of the local service to expose
    pub local_host: String,

    /// Port of the local service to expose
    pub local_port: u16,

    /// Shared secret presented at login
    pub auth_key: String,

    /// Delay policy between login attempts
    pub retry: BackoffConfig,

    /// Timeout for dialing the control channel and the SSH endpoint
    #[serde(with = "seconds")]
    pub connect_timeout: Duration,

    /// Expected SSH host key fingerprint of the broker.
    ///
    /// When unset any host key is accepted, which is only safe on a
    /// trusted network.
    pub host_key_fingerprint: Option<String>,

    /// Append the broker's public key to `authorized_keys` after login
    pub authorize_broker_key: bool,

    /// `authorized_keys` file to maintain, defaults to `~/.ssh/authorized_keys`
    pub authorized_keys_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: gethostname::gethostname().to_string_lossy().into_owned(),
            server_url: "ws://127.0.0.1:10000".to_string(),
            local_host: "localhost".to_string(),
            local_port: 22,
            auth_key: "tunnelkey".to_string(),
            retry: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(10),
            host_key_fingerprint: None,
            authorize_broker_key: true,
            authorized_keys_path: None,
        }
    }
}

impl ClientConfig {
    /// The local service the tunnel forwards to
    pub fn local_endpoint(&self) -> Endpoint {
        Endpoint::new(self.local_host.clone(), self.local_port)
    }

    /// The `authorized_keys` file to maintain
    pub fn authorized_keys_file(&self) -> PathBuf {
        self.authorized_keys_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| super::user_home(&whoami::username()))
                .join(".ssh")
                .join("authorized_keys")
        })
    }
}

/// Backoff configuration for login retries
///
/// The defaults describe a fixed three second delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "seconds")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "seconds")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(3),
            max: Duration::from_secs(3),
            multiplier: 1.0,
            jitter: 0.0,
        }
    }
}
