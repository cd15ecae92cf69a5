//! Outbound side of a control channel

use stp_protocol::{Command, Response};
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of a session's outbound queue
pub const OUTBOUND_QUEUE: usize = 32;

/// A frame waiting to be written to a client
#[derive(Debug, Clone)]
pub enum Outbound {
    Command(Command),
    Response(Response),
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control channel closed")]
    Closed,

    #[error("control channel outbound queue full")]
    Full,
}

/// Cloneable sender for one client's control channel
///
/// All writes to a client go through the session's writer task, so the
/// liveness supervisor and the session itself never write concurrently.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<Outbound>,
}

impl ControlHandle {
    /// Create a handle and the receiver its writer task drains
    pub fn channel() -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        (Self { tx }, rx)
    }

    /// Queue a frame, waiting for room
    pub async fn send(&self, frame: Outbound) -> Result<(), ControlError> {
        self.tx.send(frame).await.map_err(|_| ControlError::Closed)
    }

    /// Queue a frame without waiting
    pub fn try_send(&self, frame: Outbound) -> Result<(), ControlError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ControlError::Full,
            mpsc::error::TrySendError::Closed(_) => ControlError::Closed,
        })
    }

    /// Best-effort command delivery; failures are logged and dropped
    pub fn notify(&self, command: Command) {
        let kind = command.kind.clone();
        if let Err(e) = self.try_send(Outbound::Command(command)) {
            tracing::debug!("Dropped {} command: {}", kind, e);
        }
    }

    /// Whether the writer task has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
