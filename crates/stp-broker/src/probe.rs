//! Port liveness probing

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

/// Answers "is something listening on this port?"
///
/// Used both as the double-check before a port is handed out and as the
/// liveness probe for ports already assigned to a tunnel.
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Whether a connection to `port` currently succeeds
    async fn is_live(&self, port: u16) -> bool;
}

/// Probes by opening a short-timeout TCP connection on the loopback address
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: IpAddr,
    timeout: Duration,
}

impl TcpProbe {
    /// Probe `127.0.0.1` with the given connect timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            timeout,
        }
    }
}

#[async_trait]
impl PortProbe for TcpProbe {
    async fn is_live(&self, port: u16) -> bool {
        let addr = SocketAddr::new(self.host, port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                tracing::trace!("Probe of {} failed: {}", addr, e);
                false
            }
            Err(_) => {
                tracing::trace!("Probe of {} timed out after {:?}", addr, self.timeout);
                false
            }
        }
    }
}
