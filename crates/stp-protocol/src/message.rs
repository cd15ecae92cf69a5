//! Payload types for the control protocol
//!
//! # Message Flow
//!
//! 1. Client dials the broker and sends `login` with a [`LoginRequest`]
//! 2. Broker answers with a [`Response`]; status 200 carries a [`LoginGrant`]
//! 3. Broker sends `heartBeat` after every successful liveness probe, the
//!    client echoes a `heartBeat` back
//! 4. Broker sends `relogin` with a [`ReloginNotice`] when the client's port
//!    is found dead; the client tears everything down and starts over

use serde::{Deserialize, Serialize};

/// Login accepted
pub const STATUS_OK: u16 = 200;
/// Malformed, unrecognized, or out-of-order command
pub const STATUS_BAD_REQUEST: u16 = 400;
/// Auth key mismatch
pub const STATUS_UNAUTHORIZED: u16 = 401;
/// No free port left in the pool
pub const STATUS_PORT_EXHAUSTED: u16 = 503;

/// Payload of a `login` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    /// Shared secret configured on both sides
    pub auth_key: String,
    /// Human-readable client name
    pub name: String,
}

/// Payload of a `heartBeat` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartBeat {
    #[serde(default)]
    pub msg: String,
}

/// Payload of a `relogin` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloginNotice {
    /// Why the broker is forcing a reconnect
    #[serde(default)]
    pub msg: String,
}

/// Everything a client needs to open its reverse tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginGrant {
    /// User to authenticate as on the broker's SSH endpoint
    pub ssh_user: String,
    /// `host:port` of the broker's SSH endpoint
    pub ssh_addr: String,
    /// Port the broker assigned to this client
    #[serde(with = "port_string")]
    pub port: u16,
    /// Private key (OpenSSH/PEM text) to authenticate with
    pub private_key: String,
    /// Matching public key in `authorized_keys` format
    pub public_key: String,
}

/// Broker reply to a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// 200 on success, anything else is a rejection
    pub status: u16,
    /// Human-readable reason when rejected
    #[serde(rename = "errMsg", default)]
    pub err_msg: String,
    /// Present on a successful login
    #[serde(default)]
    pub data: Option<LoginGrant>,
}

impl Response {
    /// A successful login response
    pub fn granted(grant: LoginGrant) -> Self {
        Self {
            status: STATUS_OK,
            err_msg: String::new(),
            data: Some(grant),
        }
    }

    /// A rejection with the given status and reason
    pub fn rejected(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            err_msg: reason.into(),
            data: None,
        }
    }

    /// A 400 rejection
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::rejected(STATUS_BAD_REQUEST, reason)
    }

    /// Whether this response reports success
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Ports travel as decimal strings on the wire; numbers are accepted too.
mod port_string {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    pub fn serialize<S>(port: &u16, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&port.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u16, D::Error>
    where
        D: Deserializer<'de>,
    {
        let port = match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text
                .trim()
                .parse::<u16>()
                .map_err(|_| D::Error::custom(format!("invalid port: {text:?}")))?,
            Raw::Number(n) => {
                u16::try_from(n).map_err(|_| D::Error::custom(format!("invalid port: {n}")))?
            }
        };
        if port == 0 {
            return Err(D::Error::custom("invalid port: 0"));
        }
        Ok(port)
    }
}
