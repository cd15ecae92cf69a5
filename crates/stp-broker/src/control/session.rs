//! Per-connection command handling

use std::net::SocketAddr;
use std::sync::Arc;

use stp_protocol::{
    decode_inbound, Command, CommandKind, Inbound, LoginRequest, ProtocolError, Response,
    STATUS_BAD_REQUEST, STATUS_PORT_EXHAUSTED, STATUS_UNAUTHORIZED,
};
use thiserror::Error;

use super::handle::ControlHandle;
use crate::registry::ClientEntry;
use crate::state::BrokerState;

/// Reasons a login is rejected
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("already logged in")]
    AlreadyLoggedIn,

    #[error("invalid login payload: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("invalid auth key")]
    BadAuthKey,

    #[error("port not enough")]
    PortExhausted,
}

impl LoginError {
    /// Status code reported to the client
    pub fn status(&self) -> u16 {
        match self {
            LoginError::AlreadyLoggedIn | LoginError::Malformed(_) => STATUS_BAD_REQUEST,
            LoginError::BadAuthKey => STATUS_UNAUTHORIZED,
            LoginError::PortExhausted => STATUS_PORT_EXHAUSTED,
        }
    }
}

/// State of one client's control channel
pub struct ControlSession {
    state: Arc<BrokerState>,
    peer_addr: SocketAddr,
    handle: ControlHandle,
    client: Option<Arc<ClientEntry>>,
}

impl ControlSession {
    pub fn new(state: Arc<BrokerState>, peer_addr: SocketAddr, handle: ControlHandle) -> Self {
        Self {
            state,
            peer_addr,
            handle,
            client: None,
        }
    }

    /// The client registered by this session, once logged in
    pub fn client(&self) -> Option<&Arc<ClientEntry>> {
        self.client.as_ref()
    }

    /// Interpret one text frame, returning the reply to send (if any)
    pub async fn handle_text(&mut self, text: &str) -> Option<Response> {
        match decode_inbound(text) {
            Ok(Inbound::Command(command)) => self.handle_command(command).await,
            Ok(Inbound::Response(_)) => {
                tracing::debug!("Unexpected response frame from {}", self.peer_addr);
                Some(Response::bad_request("unexpected response"))
            }
            Err(e) => {
                tracing::warn!("Malformed frame from {}: {}", self.peer_addr, e);
                Some(Response::bad_request(format!("malformed message: {}", e)))
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Option<Response> {
        match &command.kind {
            CommandKind::Login => Some(match self.login(&command).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!("Login from {} rejected: {}", self.peer_addr, e);
                    Response::rejected(e.status(), e.to_string())
                }
            }),
            CommandKind::HeartBeat => {
                tracing::trace!("Heartbeat from {}", self.peer_addr);
                None
            }
            CommandKind::Relogin | CommandKind::Other(_) => {
                tracing::debug!("Unknown command {} from {}", command.kind, self.peer_addr);
                Some(Response::bad_request(format!(
                    "unknown command: {}",
                    command.kind
                )))
            }
        }
    }

    async fn login(&mut self, command: &Command) -> Result<Response, LoginError> {
        if self.client.is_some() {
            return Err(LoginError::AlreadyLoggedIn);
        }

        let request: LoginRequest = command.payload()?;
        if request.auth_key != self.state.config.auth_key {
            return Err(LoginError::BadAuthKey);
        }

        let port = self
            .state
            .pool
            .assign()
            .await
            .ok_or(LoginError::PortExhausted)?;

        let entry = Arc::new(ClientEntry::new(
            request.name,
            port,
            self.peer_addr,
            self.handle.clone(),
        ));
        self.state.registry.add(Arc::clone(&entry));
        tracing::info!(
            "Client {} ({}) logged in on port {}",
            entry.name(),
            self.peer_addr,
            port
        );
        self.client = Some(entry);

        Ok(Response::granted(self.state.grant(port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyMaterial;
    use crate::probe::PortProbe;
    use async_trait::async_trait;
    use stp_core::config::BrokerConfig;
    use stp_core::PortRange;
    use stp_protocol::encode_command;

    struct NothingListening;

    #[async_trait]
    impl PortProbe for NothingListening {
        async fn is_live(&self, _port: u16) -> bool {
            false
        }
    }

    fn state(start: u16, end: u16) -> Arc<BrokerState> {
        let config = BrokerConfig {
            auth_key: "secret".to_string(),
            ssh_address: "203.0.113.7:22".to_string(),
            port_range: PortRange::new(start, end).unwrap(),
            ..Default::default()
        };
        let keys = KeyMaterial::new("PRIVATE", "ssh-ed25519 AAAA broker");
        Arc::new(BrokerState::with_probe(
            config,
            keys,
            Arc::new(NothingListening),
        ))
    }

    fn session(state: &Arc<BrokerState>) -> ControlSession {
        let (handle, _rx) = ControlHandle::channel();
        ControlSession::new(Arc::clone(state), "198.51.100.2:50000".parse().unwrap(), handle)
    }

    fn login(auth_key: &str, name: &str) -> String {
        encode_command(&Command::login(auth_key, name).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_login_success() {
        let state = state(9000, 9001);
        let mut session = session(&state);

        let response = session.handle_text(&login("secret", "lab")).await.unwrap();
        assert_eq!(response.status, 200);
        let grant = response.data.unwrap();
        assert_eq!(grant.port, 9000);
        assert_eq!(grant.ssh_addr, "203.0.113.7:22");
        assert_eq!(grant.ssh_user, "root");
        assert_eq!(grant.private_key, "PRIVATE");

        let clients = state.registry.list();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].name, "lab");
        assert_eq!(clients[0].port, 9000);
        assert_eq!(session.client().unwrap().port(), 9000);
    }

    #[tokio::test]
    async fn test_bad_auth_key_has_no_side_effects() {
        let state = state(9000, 9001);
        let mut session = session(&state);

        let response = session.handle_text(&login("wrong", "lab")).await.unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(response.err_msg, "invalid auth key");
        assert!(response.data.is_none());
        assert!(state.registry.is_empty());
        assert_eq!(state.pool.used_count().await, 0);
    }

    #[tokio::test]
    async fn test_exhausted_pool_rejects() {
        let state = state(9000, 9001);
        session(&state).handle_text(&login("secret", "a")).await;
        session(&state).handle_text(&login("secret", "b")).await;

        let response = session(&state)
            .handle_text(&login("secret", "c"))
            .await
            .unwrap();
        assert_eq!(response.status, 503);
        assert_eq!(response.err_msg, "port not enough");
        assert_eq!(state.registry.len(), 2);
    }

    #[tokio::test]
    async fn test_second_login_on_same_session_rejected() {
        let state = state(9000, 9002);
        let mut session = session(&state);

        session.handle_text(&login("secret", "lab")).await;
        let response = session.handle_text(&login("secret", "lab")).await.unwrap();
        assert_eq!(response.status, 400);
        assert_eq!(state.registry.len(), 1);
        assert_eq!(state.pool.used_count().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_frames_get_bad_request() {
        let state = state(9000, 9001);
        let mut session = session(&state);

        let response = session.handle_text("not json").await.unwrap();
        assert_eq!(response.status, 400);

        // Envelope is fine but the payload is not a login request
        let bad_payload = r#"{"type":"login","data":"bm90IGpzb24="}"#;
        let response = session.handle_text(bad_payload).await.unwrap();
        assert_eq!(response.status, 400);
        assert!(session.client().is_none());

        // The session is still usable
        let response = session.handle_text(&login("secret", "lab")).await.unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_unknown_command_is_rejected() {
        let state = state(9000, 9001);
        let mut session = session(&state);

        let response = session
            .handle_text(r#"{"type":"reboot","data":""}"#)
            .await
            .unwrap();
        assert_eq!(response.status, 400);
        assert!(response.err_msg.contains("reboot"));

        let relogin = encode_command(&Command::relogin("x").unwrap()).unwrap();
        assert_eq!(session.handle_text(&relogin).await.unwrap().status, 400);
    }

    #[tokio::test]
    async fn test_heartbeat_gets_no_reply() {
        let state = state(9000, 9001);
        let mut session = session(&state);

        let heartbeat = encode_command(&Command::heart_beat("Ping").unwrap()).unwrap();
        assert!(session.handle_text(&heartbeat).await.is_none());
        assert!(state.registry.is_empty());
    }
}
