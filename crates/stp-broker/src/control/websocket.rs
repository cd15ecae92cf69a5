//! WebSocket transport for control sessions

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{Sink, SinkExt, StreamExt};
use stp_protocol::{encode_command, encode_response};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::handle::{ControlHandle, Outbound};
use super::session::ControlSession;
use crate::state::BrokerState;

/// Upgrade an HTTP request on `/` to a control channel
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<BrokerState>>,
) -> Response {
    tracing::debug!("Control channel upgrade from {}", peer_addr);
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer_addr))
}

/// Serve one control channel until the transport fails or closes
///
/// Termination leaves the client's port and registry entry alone; the
/// liveness supervisor reclaims them once the tunnel stops answering.
async fn handle_socket(socket: WebSocket, state: Arc<BrokerState>, peer_addr: SocketAddr) {
    tracing::info!("Control channel opened by {}", peer_addr);

    let (sink, mut stream) = socket.split();
    let (handle, rx) = ControlHandle::channel();
    let done = CancellationToken::new();
    let writer = tokio::spawn(write_frames(sink, rx, done.clone(), peer_addr));

    let mut session = ControlSession::new(state, peer_addr, handle.clone());

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(data)) => {
                tracing::debug!("Ignoring {} byte binary frame from {}", data.len(), peer_addr);
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("Control channel read from {} failed: {}", peer_addr, e);
                break;
            }
        };

        if let Some(response) = session.handle_text(&text).await {
            if handle.send(Outbound::Response(response)).await.is_err() {
                break;
            }
        }
    }

    // The registry may still hold a handle, so the queue alone never closes
    done.cancel();
    if let Err(e) = writer.await {
        tracing::warn!("Control channel writer for {} ended abnormally: {}", peer_addr, e);
    }
    match session.client() {
        Some(client) => tracing::info!(
            "Control channel of {} ({}) closed, port {} left to the supervisor",
            client.name(),
            peer_addr,
            client.port()
        ),
        None => tracing::info!("Control channel of {} closed before login", peer_addr),
    }
}

/// Drain the session's outbound queue into the socket
///
/// Once `done` fires, frames already queued are still written, then the
/// sink is closed.
async fn write_frames<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Outbound>,
    done: CancellationToken,
    peer_addr: SocketAddr,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = done.cancelled() => match rx.try_recv() {
                Ok(frame) => frame,
                Err(_) => break,
            },
        };
        if let Err(e) = write_frame(&mut sink, &frame).await {
            tracing::warn!("Control channel write to {} failed: {}", peer_addr, e);
            return;
        }
    }
    let _ = sink.close().await;
}

async fn write_frame<S>(sink: &mut S, frame: &Outbound) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    let encoded = match frame {
        Outbound::Command(command) => encode_command(command),
        Outbound::Response(response) => encode_response(response),
    };
    match encoded {
        Ok(text) => sink.send(Message::Text(text)).await,
        Err(e) => {
            tracing::error!("Failed to encode frame: {}", e);
            Ok(())
        }
    }
}
