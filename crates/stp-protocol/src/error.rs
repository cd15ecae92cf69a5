//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding control messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The text was not a valid JSON document of the expected shape
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
}
