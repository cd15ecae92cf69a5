//! SSH key material handed out to clients

use std::path::Path;

use russh_keys::key::PublicKey;
use stp_core::ConfigError;

/// The broker's client key pair, kept as text
///
/// The private key is passed through verbatim in every login grant; the
/// public key is what clients append to their `authorized_keys` and what
/// the embedded SSH endpoint accepts.
#[derive(Clone)]
pub struct KeyMaterial {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key.trim())
            .finish()
    }
}

impl KeyMaterial {
    pub fn new(private_key: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            private_key: private_key.into(),
            public_key: public_key.into(),
        }
    }

    /// Read both halves from disk. Either file missing is fatal.
    pub fn load(private_path: &Path, public_path: &Path) -> Result<Self, ConfigError> {
        let private_key = read_key(private_path)?;
        let public_key = read_key(public_path)?;
        tracing::info!("Loaded client key pair from {:?}", private_path);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Parse the public half
    pub fn parsed_public_key(&self) -> Result<PublicKey, ConfigError> {
        parse_authorized_key(&self.public_key).ok_or_else(|| {
            ConfigError::Invalid("public key is not in authorized_keys format".to_string())
        })
    }
}

fn read_key(path: &Path) -> Result<String, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::KeyMaterial {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if text.trim().is_empty() {
        return Err(ConfigError::KeyMaterial {
            path: path.to_path_buf(),
            reason: "file is empty".to_string(),
        });
    }
    Ok(text)
}

/// Parse an `authorized_keys` line (`type base64 [comment]`)
pub fn parse_authorized_key(line: &str) -> Option<PublicKey> {
    let mut parts = line.split_whitespace();
    let first = parts.next()?;
    match parts.next() {
        Some(encoded) => russh_keys::parse_public_key_base64(encoded).ok(),
        // Bare base64 without a type prefix
        None => russh_keys::parse_public_key_base64(first).ok(),
    }
}
