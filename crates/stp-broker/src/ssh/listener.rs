//! Embedded SSH endpoint listener

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::handler::{ForwardHandler, ForwardPolicy};

/// SSH server accepting reverse tunnels from clients
pub struct SshEndpoint {
    config: Arc<russh::server::Config>,
    policy: ForwardPolicy,
    cancel: CancellationToken,
}

impl SshEndpoint {
    pub fn new(host_key: KeyPair, policy: ForwardPolicy, cancel: CancellationToken) -> Self {
        let mut config = russh::server::Config::default();
        config.keys.push(host_key);
        config.auth_rejection_time = Duration::from_secs(1);
        config.auth_rejection_time_initial = Some(Duration::from_secs(0));

        Self {
            config: Arc::new(config),
            policy,
            cancel,
        }
    }

    /// Accept connections on `listener` until cancelled
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("SSH endpoint listening on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("SSH endpoint shutting down");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => tracing::error!("Failed to accept SSH connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::debug!("SSH connection from {}", peer_addr);

        let config = Arc::clone(&self.config);
        let cancel = self.cancel.child_token();
        let handler = ForwardHandler::new(self.policy.clone(), peer_addr, cancel.clone());

        tokio::spawn(async move {
            let session = match russh::server::run_stream(config, socket, handler).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!("SSH handshake with {} failed: {}", peer_addr, e);
                    return;
                }
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("SSH connection from {} cancelled", peer_addr);
                    return;
                }
                result = session => result,
            };

            match result {
                Ok(()) => tracing::info!("SSH connection from {} closed", peer_addr),
                Err(e) => tracing::warn!("SSH connection from {} closed with error: {}", peer_addr, e),
            }
        });
    }
}

/// Load the host key, or generate an in-memory one when the file is missing
pub fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        tracing::info!("Loading host key from {:?}", path);
        return russh_keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {:?}", path));
    }

    tracing::warn!(
        "No host key at {:?}, generating an ephemeral one; clients pinning a fingerprint will reject it after restart",
        path
    );
    KeyPair::generate_ed25519().context("Failed to generate Ed25519 host key")
}
