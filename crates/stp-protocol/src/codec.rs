//! Text codec for control-channel frames
//!
//! Each transport frame carries one JSON document: either a [`Command`]
//! (recognized by its `type` field) or a broker [`Response`].

use crate::command::Command;
use crate::error::ProtocolError;
use crate::message::Response;

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A command initiated by the peer
    Command(Command),
    /// A reply to something we sent
    Response(Response),
}

/// Encode a command as a JSON text frame
pub fn encode_command(command: &Command) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(command)?)
}

/// Encode a response as a JSON text frame
pub fn encode_response(response: &Response) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(response)?)
}

/// Decode a JSON text frame
pub fn decode_inbound(text: &str) -> Result<Inbound, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.get("type").is_some() {
        let command: Command = serde_json::from_value(value)?;
        tracing::trace!("Decoded {} command ({} payload bytes)", command.kind, command.data.len());
        Ok(Inbound::Command(command))
    } else {
        let response: Response = serde_json::from_value(value)?;
        tracing::trace!("Decoded response with status {}", response.status);
        Ok(Inbound::Response(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use crate::message::{ReloginNotice, STATUS_UNAUTHORIZED};

    #[test]
    fn test_command_frame_decodes_as_command() {
        let text = encode_command(&Command::relogin("check port 9000 offline").unwrap()).unwrap();

        match decode_inbound(&text).unwrap() {
            Inbound::Command(cmd) => {
                assert_eq!(cmd.kind, CommandKind::Relogin);
                let notice: ReloginNotice = cmd.payload().unwrap();
                assert_eq!(notice.msg, "check port 9000 offline");
            }
            other => panic!("Expected command, got {:?}", other),
        }
    }

    #[test]
    fn test_response_frame_decodes_as_response() {
        let text = encode_response(&Response::rejected(STATUS_UNAUTHORIZED, "invalid auth key")).unwrap();

        match decode_inbound(&text).unwrap() {
            Inbound::Response(resp) => {
                assert_eq!(resp.status, STATUS_UNAUTHORIZED);
                assert_eq!(resp.err_msg, "invalid auth key");
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(matches!(decode_inbound("not json"), Err(ProtocolError::Json(_))));
        assert!(decode_inbound(r#"{"hello":"world"}"#).is_err());
    }

    #[test]
    fn test_decodes_frame_from_foreign_peer() {
        // Peers that serialize byte arrays as base64 produce exactly this shape
        let text = r#"{"type":"login","data":"eyJhdXRoS2V5IjoidHVubmVsa2V5IiwibmFtZSI6ImxhYiJ9"}"#;
        let Inbound::Command(cmd) = decode_inbound(text).unwrap() else {
            panic!("Expected command");
        };
        let req: crate::LoginRequest = cmd.payload().unwrap();
        assert_eq!(req.auth_key, "tunnelkey");
        assert_eq!(req.name, "lab");
    }
}
