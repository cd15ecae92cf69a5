//! SSH connection handler for the embedded tunnel endpoint
//!
//! Accepts only the broker's own key pair, grants `tcpip-forward` requests
//! for ports inside the pool's range and turns every connection accepted on
//! such a forward into a `forwarded-tcpip` channel back to the client.

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::Channel;
use russh_keys::key::PublicKey;
use stp_core::{splice, PortRange};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// What a connection is allowed to do
#[derive(Debug, Clone)]
pub struct ForwardPolicy {
    /// User clients must authenticate as
    pub user: String,
    /// Fingerprint of the only accepted public key
    pub key_fingerprint: String,
    /// Ports that may be forwarded
    pub range: PortRange,
}

/// Handler for a single SSH connection
pub struct ForwardHandler {
    policy: ForwardPolicy,
    peer_addr: SocketAddr,
    /// Active forwards keyed by requested (address, port)
    forwards: HashMap<(String, u32), CancellationToken>,
    /// Parent of every forward's token; cancelled when the connection ends
    cancel: CancellationToken,
}

impl ForwardHandler {
    pub fn new(policy: ForwardPolicy, peer_addr: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            policy,
            peer_addr,
            forwards: HashMap::new(),
            cancel,
        }
    }
}

impl Drop for ForwardHandler {
    fn drop(&mut self) {
        if !self.forwards.is_empty() {
            tracing::debug!(
                "Stopping {} forward(s) of {}",
                self.forwards.len(),
                self.peer_addr
            );
        }
        self.cancel.cancel();
    }
}

#[async_trait]
impl Handler for ForwardHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint();

        if user == self.policy.user && fingerprint == self.policy.key_fingerprint {
            tracing::info!("Tunnel login from {} as {}", self.peer_addr, user);
            return Ok(Auth::Accept);
        }

        tracing::warn!(
            "Authentication rejected for {} ({}), key fingerprint: {}",
            self.peer_addr,
            user,
            fingerprint
        );
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    /// Tunnel-only endpoint: no shells, no exec
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "Refusing session channel {:?} from {}",
            channel.id(),
            self.peer_addr
        );
        Ok(false)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let requested = match u16::try_from(*port) {
            Ok(p) if self.policy.range.contains(p) => p,
            _ => {
                tracing::warn!(
                    "Refusing forward of port {} for {}: outside {}",
                    port,
                    self.peer_addr,
                    self.policy.range
                );
                return Ok(false);
            }
        };

        let key = (address.to_string(), *port);
        if self.forwards.contains_key(&key) {
            tracing::warn!("Forward {}:{} already active", address, port);
            return Ok(false);
        }

        let bind_host = if address.is_empty() { "0.0.0.0" } else { address };
        let listener = match TcpListener::bind((bind_host, requested)).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!("Failed to listen on {}:{}: {}", bind_host, requested, e);
                return Ok(false);
            }
        };

        tracing::info!(
            "Forwarding {}:{} to {}",
            bind_host,
            requested,
            self.peer_addr
        );

        let token = self.cancel.child_token();
        self.forwards.insert(key, token.clone());
        tokio::spawn(accept_forwarded(
            listener,
            session.handle(),
            address.to_string(),
            *port,
            token,
        ));

        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match self.forwards.remove(&(address.to_string(), port)) {
            Some(token) => {
                tracing::info!("Forward {}:{} cancelled by {}", address, port, self.peer_addr);
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Accept loop of one remote forward
async fn accept_forwarded(
    listener: TcpListener,
    handle: Handle,
    address: String,
    port: u32,
    cancel: CancellationToken,
) {
    loop {
        let (stream, originator) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Accept on forwarded port {} failed: {}", port, e);
                    continue;
                }
            },
        };

        tracing::debug!("Forwarded connection on port {} from {}", port, originator);
        let handle = handle.clone();
        let address = address.clone();
        tokio::spawn(async move {
            if let Err(e) = forward_connection(stream, originator, handle, address, port).await {
                tracing::debug!("Forwarded connection from {} ended: {}", originator, e);
            }
        });
    }

    tracing::debug!("Forward listener on port {} stopped", port);
}

async fn forward_connection(
    stream: TcpStream,
    originator: SocketAddr,
    handle: Handle,
    address: String,
    port: u32,
) -> anyhow::Result<()> {
    let channel = handle
        .channel_open_forwarded_tcpip(
            address,
            port,
            originator.ip().to_string(),
            u32::from(originator.port()),
        )
        .await?;

    splice(stream, channel.into_stream()).await?;
    Ok(())
}
