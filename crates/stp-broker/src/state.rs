//! Shared broker state

use std::sync::Arc;

use stp_core::config::BrokerConfig;
use stp_protocol::LoginGrant;

use crate::keys::KeyMaterial;
use crate::pool::PortPool;
use crate::probe::{PortProbe, TcpProbe};
use crate::registry::ClientRegistry;

/// Global state for the broker daemon
pub struct BrokerState {
    /// Configuration
    pub config: BrokerConfig,
    /// Key pair handed out to clients
    pub keys: KeyMaterial,
    /// Assignable ports
    pub pool: Arc<PortPool>,
    /// Logged-in clients
    pub registry: Arc<ClientRegistry>,
}

impl BrokerState {
    /// Create broker state probing ports over TCP
    pub fn new(config: BrokerConfig, keys: KeyMaterial) -> Self {
        let probe = Arc::new(TcpProbe::new(config.probe_timeout));
        Self::with_probe(config, keys, probe)
    }

    /// Create broker state with a custom port probe
    pub fn with_probe(config: BrokerConfig, keys: KeyMaterial, probe: Arc<dyn PortProbe>) -> Self {
        let pool = Arc::new(PortPool::new(config.port_range, probe));
        Self {
            config,
            keys,
            pool,
            registry: Arc::new(ClientRegistry::new()),
        }
    }

    /// Credentials for a client that was assigned `port`
    pub fn grant(&self, port: u16) -> LoginGrant {
        LoginGrant {
            ssh_user: self.config.ssh_user.clone(),
            ssh_addr: self.config.ssh_address.clone(),
            port,
            private_key: self.keys.private_key.clone(),
            public_key: self.keys.public_key.clone(),
        }
    }
}
