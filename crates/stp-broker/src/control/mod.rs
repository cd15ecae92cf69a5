//! Broker side of the control channel
//!
//! Each WebSocket connection gets a [`ControlSession`] that interprets the
//! client's commands and a writer task that drains the session's
//! [`ControlHandle`] queue into the socket.

mod handle;
mod session;
mod websocket;

pub use handle::{ControlError, ControlHandle, Outbound, OUTBOUND_QUEUE};
pub use session::{ControlSession, LoginError};
pub use websocket::ws_handler;
