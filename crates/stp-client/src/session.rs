//! Client side of the control channel
//!
//! A [`ControlClient`] walks the session state machine:
//!
//! ```text
//! Disconnected -> Connecting -> LoggingIn -> Active
//!      ^                                       |
//!      +------ relogin notice / channel error --+
//! ```
//!
//! Login failures are retried forever with the configured backoff. Once
//! logged in, the client answers heartbeats and tears its tunnel down as
//! soon as the broker asks for a relogin or the channel fails.
//!
//! A tunnel that fails to start does not fail the login. The broker has
//! already assigned a port, so the session stays active on the control
//! channel until the broker reclaims that port and asks for a relogin.

use futures::{SinkExt, StreamExt};
use stp_core::authorized_keys::add_authorized_key;
use stp_core::config::ClientConfig;
use stp_core::Endpoint;
use stp_protocol::{
    decode_inbound, encode_command, Command, CommandKind, Inbound, LoginGrant, ProtocolError,
    ReloginNotice, Response,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::tunnel::{ExponentialBackoff, ReverseTunnel, TunnelError, TunnelHandle, TunnelSpec};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reply sent to every broker heartbeat
const HEARTBEAT_ECHO: &str = "Ping";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    LoggingIn,
    Active,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("control channel error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("timed out connecting to {0}")]
    Timeout(String),

    #[error("control channel closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("login rejected ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("invalid login grant: {0}")]
    InvalidGrant(String),
}

/// Why an active session ended
#[derive(Debug)]
pub enum SessionEnd {
    /// The broker asked for a relogin
    Relogin(String),
    /// The broker closed the control channel
    Closed,
    /// The control channel failed
    Failed(SessionError),
}

/// A logged-in session and the outcome of starting its tunnel
pub struct ActiveSession {
    ws: WsStream,
    grant: LoginGrant,
    tunnel: Result<TunnelHandle, TunnelError>,
}

impl ActiveSession {
    /// Credentials and port granted at login
    pub fn grant(&self) -> &LoginGrant {
        &self.grant
    }

    /// Port the broker assigned
    pub fn port(&self) -> u16 {
        self.grant.port
    }

    /// Whether the tunnel is still accepting connections
    pub fn tunnel_running(&self) -> bool {
        self.tunnel.as_ref().is_ok_and(TunnelHandle::is_running)
    }

    /// Why the tunnel failed to start, if it did
    pub fn tunnel_error(&self) -> Option<&TunnelError> {
        self.tunnel.as_ref().err()
    }
}

/// Drives login, heartbeat echo and relogin for one client
pub struct ControlClient {
    config: ClientConfig,
    state: SessionState,
}

impl ControlClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: SessionState::Disconnected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Log in and serve sessions forever
    pub async fn run(&mut self) {
        let mut backoff = ExponentialBackoff::from_config(&self.config.retry);

        loop {
            let session = self.login_with_retry(&mut backoff).await;
            match self.serve(session).await {
                SessionEnd::Relogin(reason) => {
                    tracing::info!("Broker requested relogin: {}", reason)
                }
                SessionEnd::Closed => tracing::warn!("Broker closed the control channel"),
                SessionEnd::Failed(e) => tracing::warn!("Session ended: {}", e),
            }
        }
    }

    /// Retry [`ControlClient::login`] until it succeeds
    pub async fn login_with_retry(&mut self, backoff: &mut ExponentialBackoff) -> ActiveSession {
        loop {
            match self.login().await {
                Ok(session) => {
                    backoff.reset();
                    return session;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Login failed: {}. Retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One login attempt: dial, log in, start the tunnel
    ///
    /// Only control-channel failures are errors. Once the broker has granted
    /// a port the session is returned even if the tunnel did not come up.
    pub async fn login(&mut self) -> Result<ActiveSession, SessionError> {
        let result = self.try_login().await;
        self.state = match result {
            Ok(_) => SessionState::Active,
            Err(_) => SessionState::Disconnected,
        };
        result
    }

    async fn try_login(&mut self) -> Result<ActiveSession, SessionError> {
        self.state = SessionState::Connecting;
        let url = self.config.server_url.clone();
        tracing::debug!("Connecting to {}", url);

        let (mut ws, _response) = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| SessionError::Timeout(url.clone()))??;

        self.state = SessionState::LoggingIn;
        let login = Command::login(&self.config.auth_key, &self.config.name)?;
        ws.send(Message::Text(encode_command(&login)?)).await?;

        let response = read_response(&mut ws).await?;
        if !response.is_ok() {
            return Err(SessionError::Rejected {
                status: response.status,
                reason: response.err_msg,
            });
        }
        let grant = response
            .data
            .ok_or_else(|| SessionError::InvalidGrant("missing data".to_string()))?;
        let ssh_addr: Endpoint = grant
            .ssh_addr
            .parse()
            .map_err(|_| SessionError::InvalidGrant(format!("bad sshAddr {}", grant.ssh_addr)))?;

        tracing::info!("Logged in to {} as {}, port {}", url, self.config.name, grant.port);

        if self.config.authorize_broker_key {
            self.authorize_broker_key(&grant.public_key);
        }

        let tunnel = ReverseTunnel::start(TunnelSpec {
            local: self.config.local_endpoint(),
            ssh_addr,
            remote: Endpoint::any(grant.port),
            user: grant.ssh_user.clone(),
            private_key: grant.private_key.clone(),
            host_key_fingerprint: self.config.host_key_fingerprint.clone(),
            connect_timeout: self.config.connect_timeout,
        })
        .await;
        if let Err(e) = &tunnel {
            tracing::warn!(
                "Tunnel for port {} failed: {}. Waiting for the broker to reclaim it",
                grant.port,
                e
            );
        }

        Ok(ActiveSession { ws, grant, tunnel })
    }

    fn authorize_broker_key(&self, public_key: &str) {
        let path = self.config.authorized_keys_file();
        match add_authorized_key(&path, public_key) {
            Ok(true) => tracing::info!("Added broker key to {:?}", path),
            Ok(false) => tracing::debug!("Broker key already in {:?}", path),
            Err(e) => tracing::warn!("Failed to update {:?}: {}", path, e),
        }
    }

    /// Service an active session until it ends, then stop its tunnel
    pub async fn serve(&mut self, session: ActiveSession) -> SessionEnd {
        let ActiveSession {
            mut ws,
            grant,
            tunnel,
        } = session;
        tracing::debug!("Serving control channel for port {}", grant.port);

        let end = serve_commands(&mut ws).await;

        if let Ok(tunnel) = tunnel {
            tunnel.stop().await;
        }
        let _ = ws.close(None).await;
        self.state = SessionState::Disconnected;
        end
    }
}

/// Wait for the broker's reply to a login
async fn read_response(ws: &mut WsStream) -> Result<Response, SessionError> {
    while let Some(frame) = ws.next().await {
        match frame? {
            Message::Text(text) => match decode_inbound(&text)? {
                Inbound::Response(response) => return Ok(response),
                Inbound::Command(command) => {
                    tracing::debug!("Ignoring {} before login completed", command.kind);
                }
            },
            Message::Close(_) => return Err(SessionError::Closed),
            _ => {}
        }
    }
    Err(SessionError::Closed)
}

/// Answer broker commands until a relogin or a channel failure
async fn serve_commands(ws: &mut WsStream) -> SessionEnd {
    while let Some(frame) = ws.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return SessionEnd::Closed,
            Ok(_) => continue,
            Err(e) => return SessionEnd::Failed(e.into()),
        };

        let command = match decode_inbound(&text) {
            Ok(Inbound::Command(command)) => command,
            Ok(Inbound::Response(response)) => {
                tracing::warn!(
                    "Broker rejected a command ({}): {}",
                    response.status,
                    response.err_msg
                );
                continue;
            }
            Err(e) => {
                tracing::warn!("Malformed frame from broker: {}", e);
                continue;
            }
        };

        match &command.kind {
            CommandKind::HeartBeat => {
                tracing::trace!("Heartbeat from broker");
                if let Err(e) = send_heartbeat(ws).await {
                    return SessionEnd::Failed(e);
                }
            }
            CommandKind::Relogin => {
                let reason = command
                    .payload::<ReloginNotice>()
                    .map(|n| n.msg)
                    .unwrap_or_default();
                return SessionEnd::Relogin(reason);
            }
            other => tracing::debug!("Ignoring {} command", other),
        }
    }

    SessionEnd::Closed
}

async fn send_heartbeat(ws: &mut WsStream) -> Result<(), SessionError> {
    let echo = Command::heart_beat(HEARTBEAT_ECHO)?;
    ws.send(Message::Text(encode_command(&echo)?)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::time::Duration;
    use stp_core::config::BackoffConfig;
    use stp_protocol::{encode_response, HeartBeat, LoginRequest};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    type BrokerSocket = WebSocketStream<TcpStream>;

    async fn read_login(ws: &mut BrokerSocket) -> LoginRequest {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(Inbound::Command(command)) = decode_inbound(&text) {
                        return command.payload::<LoginRequest>().unwrap();
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("channel ended before login: {:?}", other),
            }
        }
    }

    async fn next_command(ws: &mut BrokerSocket) -> Command {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(Inbound::Command(command)) = decode_inbound(&text) {
                        return command;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("channel ended before a command: {:?}", other),
            }
        }
    }

    /// Broker stand-in answering one login per connection, in order.
    /// The last connection is handed to `after_login`.
    async fn scripted_broker<F, Fut>(
        responses: Vec<Response>,
        after_login: F,
    ) -> (String, JoinHandle<Vec<LoginRequest>>)
    where
        F: FnOnce(BrokerSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let task = tokio::spawn(async move {
            let mut requests = Vec::new();
            let mut last = None;
            for response in responses {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                requests.push(read_login(&mut ws).await);
                ws.send(Message::Text(encode_response(&response).unwrap()))
                    .await
                    .unwrap();
                last = Some(ws);
            }
            if let Some(ws) = last {
                after_login(ws).await;
            }
            requests
        });

        (url, task)
    }

    /// Broker stand-in that answers the first login with `response`
    async fn fake_broker(response: Response) -> (String, JoinHandle<Vec<LoginRequest>>) {
        scripted_broker(vec![response], |_ws| async {}).await
    }

    /// Grant whose SSH endpoint refuses connections
    fn unreachable_grant() -> LoginGrant {
        LoginGrant {
            ssh_user: "root".to_string(),
            ssh_addr: "127.0.0.1:1".to_string(),
            port: 20000,
            private_key: "not a key".to_string(),
            public_key: "ssh-ed25519 AAAAbroker stp".to_string(),
        }
    }

    fn config(url: String) -> ClientConfig {
        ClientConfig {
            name: "lab".to_string(),
            server_url: url,
            auth_key: "secret".to_string(),
            connect_timeout: Duration::from_secs(2),
            authorize_broker_key: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_rejected_login() {
        let (url, broker) = fake_broker(Response::rejected(401, "invalid auth key")).await;
        let mut client = ControlClient::new(config(url));

        let err = client.login().await.err().unwrap();
        match err {
            SessionError::Rejected { status, reason } => {
                assert_eq!(status, 401);
                assert_eq!(reason, "invalid auth key");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(client.state(), SessionState::Disconnected);

        let requests = broker.await.unwrap();
        assert_eq!(requests[0].auth_key, "secret");
        assert_eq!(requests[0].name, "lab");
    }

    #[tokio::test]
    async fn test_grant_with_bad_ssh_addr() {
        let grant = LoginGrant {
            ssh_addr: "not-an-address".to_string(),
            ..unreachable_grant()
        };
        let (url, _broker) = fake_broker(Response::granted(grant)).await;
        let mut client = ControlClient::new(config(url));

        let err = client.login().await.err().unwrap();
        assert!(matches!(err, SessionError::InvalidGrant(_)));
    }

    #[tokio::test]
    async fn test_ok_status_without_grant() {
        let response = Response {
            status: 200,
            err_msg: String::new(),
            data: None,
        };
        let (url, _broker) = fake_broker(response).await;
        let mut client = ControlClient::new(config(url));

        let err = client.login().await.err().unwrap();
        assert!(matches!(err, SessionError::InvalidGrant(_)));
    }

    #[tokio::test]
    async fn test_unreachable_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let mut client = ControlClient::new(config(url));
        assert!(matches!(
            client.login().await,
            Err(SessionError::Transport(_))
        ));
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_broker_key_is_authorized_after_login() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");

        let (url, _broker) = fake_broker(Response::granted(unreachable_grant())).await;
        let mut client = ControlClient::new(ClientConfig {
            authorize_broker_key: true,
            authorized_keys_path: Some(path.clone()),
            ..config(url)
        });

        client.login().await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), "ssh-ed25519 AAAAbroker stp");
    }

    #[tokio::test]
    async fn test_failed_tunnel_keeps_the_granted_session() {
        let (relogin_tx, relogin_rx) = oneshot::channel::<()>();
        let (url, broker) =
            scripted_broker(vec![Response::granted(unreachable_grant())], |mut ws| async move {
                // Port reclaimed by the broker once it finds nothing listening
                relogin_rx.await.unwrap();
                let notice = Command::relogin("check port 20000 offline").unwrap();
                ws.send(Message::Text(encode_command(&notice).unwrap()))
                    .await
                    .unwrap();
                let _ = ws.next().await;
            })
            .await;
        let mut client = ControlClient::new(config(url));

        let session = client.login().await.unwrap();
        assert_eq!(client.state(), SessionState::Active);
        assert_eq!(session.port(), 20000);
        assert!(!session.tunnel_running());
        assert!(session.tunnel_error().is_some());

        relogin_tx.send(()).unwrap();
        let end = tokio::time::timeout(Duration::from_secs(5), client.serve(session))
            .await
            .unwrap();
        match end {
            SessionEnd::Relogin(reason) => assert_eq!(reason, "check port 20000 offline"),
            other => panic!("unexpected session end: {:?}", other),
        }
        assert_eq!(client.state(), SessionState::Disconnected);

        // One login, one port: the client never dialed again on its own
        assert_eq!(broker.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_is_echoed() {
        let (echo_tx, echo_rx) = oneshot::channel();
        let (url, _broker) =
            scripted_broker(vec![Response::granted(unreachable_grant())], |mut ws| async move {
                let ping = Command::heart_beat("Ping").unwrap();
                ws.send(Message::Text(encode_command(&ping).unwrap()))
                    .await
                    .unwrap();
                echo_tx.send(next_command(&mut ws).await).unwrap();
                ws.close(None).await.unwrap();
                let _ = ws.next().await;
            })
            .await;
        let mut client = ControlClient::new(config(url));

        let session = client.login().await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(5), client.serve(session))
            .await
            .unwrap();

        let echo = echo_rx.await.unwrap();
        assert_eq!(echo.kind, CommandKind::HeartBeat);
        assert_eq!(echo.payload::<HeartBeat>().unwrap().msg, "Ping");
        assert!(matches!(end, SessionEnd::Closed));
    }

    #[tokio::test]
    async fn test_channel_close_ends_session() {
        let (url, _broker) = scripted_broker(
            vec![Response::granted(unreachable_grant())],
            |mut ws| async move {
                ws.close(None).await.unwrap();
                let _ = ws.next().await;
            },
        )
        .await;
        let mut client = ControlClient::new(config(url));

        let session = client.login().await.unwrap();
        assert_eq!(client.state(), SessionState::Active);

        let end = tokio::time::timeout(Duration::from_secs(5), client.serve(session))
            .await
            .unwrap();
        assert!(matches!(end, SessionEnd::Closed));
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_dropped_channel_fails_session() {
        let (url, _broker) =
            scripted_broker(vec![Response::granted(unreachable_grant())], |ws| async move {
                drop(ws);
            })
            .await;
        let mut client = ControlClient::new(config(url));

        let session = client.login().await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(5), client.serve(session))
            .await
            .unwrap();
        assert!(matches!(end, SessionEnd::Failed(_) | SessionEnd::Closed));
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_login_retries_until_granted() {
        let responses = vec![
            Response::rejected(503, "port not enough"),
            Response::rejected(503, "port not enough"),
            Response::granted(unreachable_grant()),
        ];
        let (url, broker) = scripted_broker(responses, |_ws| async {}).await;
        let mut client = ControlClient::new(config(url));

        let mut backoff = ExponentialBackoff::from_config(&BackoffConfig {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(20),
            ..Default::default()
        });
        let session = tokio::time::timeout(
            Duration::from_secs(10),
            client.login_with_retry(&mut backoff),
        )
        .await
        .unwrap();

        assert_eq!(session.port(), 20000);
        assert_eq!(client.state(), SessionState::Active);
        assert_eq!(broker.await.unwrap().len(), 3);
    }
}
