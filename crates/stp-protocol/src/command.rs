//! The command envelope
//!
//! Every message a peer initiates on the control channel is a [`Command`]:
//! a type tag plus an opaque payload. The payload is the JSON encoding of
//! the type-specific message, carried base64-encoded in the `data` field.

use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::message::{HeartBeat, LoginRequest, ReloginNotice};

/// Command type tag
///
/// Unrecognized tags are preserved as [`CommandKind::Other`] so a receiver
/// can reject them explicitly instead of failing to decode the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandKind {
    /// Client asks to be registered and assigned a port (client → broker)
    Login,
    /// Liveness ping, either direction
    HeartBeat,
    /// Broker forces the client to tear down and log in again (broker → client)
    Relogin,
    /// Anything else
    Other(String),
}

impl CommandKind {
    /// Wire name of this command type
    pub fn as_str(&self) -> &str {
        match self {
            CommandKind::Login => "login",
            CommandKind::HeartBeat => "heartBeat",
            CommandKind::Relogin => "relogin",
            CommandKind::Other(name) => name,
        }
    }
}

impl From<String> for CommandKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "login" => CommandKind::Login,
            "heartBeat" => CommandKind::HeartBeat,
            "relogin" => CommandKind::Relogin,
            _ => CommandKind::Other(name),
        }
    }
}

impl From<CommandKind> for String {
    fn from(kind: CommandKind) -> Self {
        match kind {
            CommandKind::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A control-channel command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Command type
    #[serde(rename = "type")]
    pub kind: CommandKind,
    /// JSON-encoded payload, decoded according to `kind`
    #[serde(with = "base64_bytes", default)]
    pub data: Bytes,
}

impl Command {
    /// Build a command from a typed payload
    pub fn new<T: Serialize>(kind: CommandKind, payload: &T) -> Result<Self, ProtocolError> {
        let data = serde_json::to_vec(payload)?;
        Ok(Self {
            kind,
            data: Bytes::from(data),
        })
    }

    /// A `login` command
    pub fn login(auth_key: impl Into<String>, name: impl Into<String>) -> Result<Self, ProtocolError> {
        Self::new(
            CommandKind::Login,
            &LoginRequest {
                auth_key: auth_key.into(),
                name: name.into(),
            },
        )
    }

    /// A `heartBeat` command
    pub fn heart_beat(msg: impl Into<String>) -> Result<Self, ProtocolError> {
        Self::new(CommandKind::HeartBeat, &HeartBeat { msg: msg.into() })
    }

    /// A `relogin` command carrying the reason the broker is forcing it
    pub fn relogin(reason: impl Into<String>) -> Result<Self, ProtocolError> {
        Self::new(CommandKind::Relogin, &ReloginNotice { msg: reason.into() })
    }

    /// Decode the payload as `T`
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Serde helper for byte payloads carried as base64 strings.
///
/// `null` and a missing field both decode to an empty payload.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(Bytes::new()),
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Bytes::from)
                .map_err(serde::de::Error::custom),
        }
    }
}
