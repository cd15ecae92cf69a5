//! Outbound SSH session carrying a remote port forward
//!
//! The client connects to the broker's SSH endpoint, asks it to listen on
//! the assigned port and splices every connection the broker forwards back
//! onto a fresh connection to the local service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle, Msg, Session};
use russh::{Channel, Disconnect};
use russh_keys::key::PublicKey;
use stp_core::{splice, Endpoint};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Forwarded channels queued between the SSH session and the accept loop
const FORWARDED_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid private key: {0}")]
    InvalidKey(#[source] russh_keys::Error),

    #[error("timed out connecting to {0}")]
    Timeout(Endpoint),

    #[error("host key verification failed: expected {expected}, got {actual}")]
    HostKeyMismatch { expected: String, actual: String },

    #[error("authentication as {0} rejected")]
    AuthRejected(String),

    #[error("remote forward of {0} refused: {1}")]
    ForwardRefused(Endpoint, #[source] russh::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),
}

/// Everything needed to bring up one reverse tunnel
#[derive(Clone)]
pub struct TunnelSpec {
    /// Local service forwarded connections are spliced onto
    pub local: Endpoint,
    /// Broker SSH endpoint
    pub ssh_addr: Endpoint,
    /// Address the broker listens on, `0.0.0.0:<assigned port>`
    pub remote: Endpoint,
    /// SSH user
    pub user: String,
    /// Private key text handed out by the broker
    pub private_key: String,
    /// Expected host key fingerprint; any key is accepted when unset
    pub host_key_fingerprint: Option<String>,
    /// Timeout of the TCP connect and SSH handshake
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for TunnelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSpec")
            .field("local", &self.local)
            .field("ssh_addr", &self.ssh_addr)
            .field("remote", &self.remote)
            .field("user", &self.user)
            .field("host_key_fingerprint", &self.host_key_fingerprint)
            .finish_non_exhaustive()
    }
}

pub struct ReverseTunnel;

impl ReverseTunnel {
    /// Connect, authenticate, request the remote forward and start accepting
    ///
    /// Returns once the broker has granted the forward.
    pub async fn start(spec: TunnelSpec) -> Result<TunnelHandle, TunnelError> {
        let key = russh_keys::decode_secret_key(&spec.private_key, None)
            .map_err(TunnelError::InvalidKey)?;

        let (channel_tx, channel_rx) = mpsc::channel(FORWARDED_CHANNEL_CAPACITY);
        let handler = TunnelClient {
            expected_fingerprint: spec.host_key_fingerprint.clone(),
            channels: channel_tx,
        };

        tracing::debug!("Connecting to SSH endpoint {}", spec.ssh_addr);
        let addr = (spec.ssh_addr.host.clone(), spec.ssh_addr.port);
        let mut session = tokio::time::timeout(
            spec.connect_timeout,
            client::connect(Arc::new(Config::default()), addr, handler),
        )
        .await
        .map_err(|_| TunnelError::Timeout(spec.ssh_addr.clone()))??;

        let authenticated = session
            .authenticate_publickey(&spec.user, Arc::new(key))
            .await?;
        if !authenticated {
            return Err(TunnelError::AuthRejected(spec.user.clone()));
        }

        session
            .tcpip_forward(spec.remote.host.clone(), u32::from(spec.remote.port))
            .await
            .map_err(|e| TunnelError::ForwardRefused(spec.remote.clone(), e))?;

        tracing::info!(
            "Tunnel up: {} on {} -> {}",
            spec.remote,
            spec.ssh_addr,
            spec.local
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(channel_rx, spec.local.clone(), cancel.clone()));

        Ok(TunnelHandle {
            remote: spec.remote,
            session,
            cancel,
            task,
            teardown_timeout: spec.connect_timeout,
        })
    }
}

/// A running tunnel
///
/// Dropping the handle without calling [`TunnelHandle::stop`] leaves the
/// accept loop running until the SSH session closes.
pub struct TunnelHandle {
    remote: Endpoint,
    session: Handle<TunnelClient>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    teardown_timeout: Duration,
}

impl TunnelHandle {
    /// Remote endpoint the broker listens on
    pub fn remote(&self) -> &Endpoint {
        &self.remote
    }

    /// Whether the accept loop is still running
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop accepting and close the SSH session
    ///
    /// Returns after the accept loop has exited, so no connection is
    /// accepted afterwards. Connections already spliced drain on their own.
    /// The remote teardown is bounded by the connect timeout.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("Tunnel accept loop ended abnormally: {}", e);
        }

        let session = &self.session;
        let remote = &self.remote;
        let teardown = async {
            if let Err(e) = session
                .cancel_tcpip_forward(remote.host.clone(), u32::from(remote.port))
                .await
            {
                tracing::debug!("cancel-tcpip-forward for {} failed: {}", remote, e);
            }
            if let Err(e) = session
                .disconnect(Disconnect::ByApplication, "tunnel stopped", "en")
                .await
            {
                tracing::debug!("SSH disconnect failed: {}", e);
            }
        };
        if tokio::time::timeout(self.teardown_timeout, teardown)
            .await
            .is_err()
        {
            tracing::warn!("SSH peer for {} did not answer teardown, dropping session", remote);
        }

        tracing::info!("Tunnel on {} stopped", remote);
    }
}

/// Take forwarded channels until cancelled or the session goes away
async fn accept_loop(
    mut channels: mpsc::Receiver<Channel<Msg>>,
    local: Endpoint,
    cancel: CancellationToken,
) {
    loop {
        let channel = tokio::select! {
            _ = cancel.cancelled() => break,
            channel = channels.recv() => match channel {
                Some(channel) => channel,
                None => {
                    tracing::warn!("SSH session closed, tunnel stopped accepting");
                    break;
                }
            },
        };

        let local = local.clone();
        tokio::spawn(async move {
            let stream = match TcpStream::connect((local.host.as_str(), local.port)).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("Failed to reach local service {}: {}", local, e);
                    let _ = channel.close().await;
                    return;
                }
            };
            if let Err(e) = splice(stream, channel.into_stream()).await {
                tracing::debug!("Forwarded connection to {} ended: {}", local, e);
            }
        });
    }
}

/// russh client handler of a tunnel session
struct TunnelClient {
    expected_fingerprint: Option<String>,
    channels: mpsc::Sender<Channel<Msg>>,
}

#[async_trait]
impl client::Handler for TunnelClient {
    type Error = TunnelError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();

        match &self.expected_fingerprint {
            Some(expected) if *expected == fingerprint => {
                tracing::debug!("Host key verified: {}", fingerprint);
                Ok(true)
            }
            Some(expected) => Err(TunnelError::HostKeyMismatch {
                expected: expected.clone(),
                actual: fingerprint,
            }),
            None => {
                tracing::warn!(
                    "Accepting unverified SSH host key {}; set host_key_fingerprint to pin it",
                    fingerprint
                );
                Ok(true)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(
            "Forwarded connection on {}:{} from {}:{}",
            connected_address,
            connected_port,
            originator_address,
            originator_port
        );

        if self.channels.send(channel).await.is_err() {
            tracing::debug!("Tunnel stopped, dropping forwarded connection");
        }
        Ok(())
    }
}
