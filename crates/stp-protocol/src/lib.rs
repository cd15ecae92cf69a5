//! stp-protocol: Control-channel wire protocol for stp
//!
//! This crate defines the messages exchanged between a tunnel client and
//! the broker over the persistent control channel: the command envelope,
//! the typed payloads carried inside it, and the broker's responses.

pub mod codec;
pub mod command;
pub mod error;
pub mod message;

pub use codec::{decode_inbound, encode_command, encode_response, Inbound};
pub use command::{Command, CommandKind};
pub use error::ProtocolError;
pub use message::{
    HeartBeat, LoginGrant, LoginRequest, ReloginNotice, Response, STATUS_BAD_REQUEST, STATUS_OK,
    STATUS_PORT_EXHAUSTED, STATUS_UNAUTHORIZED,
};
