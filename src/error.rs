//! Error taxonomies for the wire codec and the session API.

use crate::types::*;
use thiserror::Error;

/// Frame decoding failures. Always fatal to the connection the frame
/// arrived on; never surfaced to the caller as a typed error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    /// The outer record claims more bytes than the buffer holds.
    #[error("frame truncated")]
    Incomplete,
    /// An inner record is truncated or its length is incompatible with
    /// its type (odd WSTRING, wrong-size DWORD/GUID, invalid UTF-16).
    #[error("frame malformed")]
    Malformed,
    /// Indexed access past the last field.
    #[error("field {0} missing")]
    MissingField(usize),
    /// Field present but of the wrong type.
    #[error("field {0} has unexpected type")]
    TypeMismatch(usize),
}

/// Errors surfaced through the session API and completion events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    #[error("operation not legal in the current session state")]
    InvalidState,
    #[error("player not found")]
    PlayerNotFound,
    #[error("group not found")]
    GroupNotFound,
    #[error("async operation handle not found")]
    HandleNotFound,
    #[error("buffer handle not found")]
    BufferNotFound,
    /// The host declined the join; carries the wire error code.
    #[error("connection rejected (code {0})")]
    Rejected(u32),
    #[error("connection lost")]
    ConnectionLost,
    #[error("operation cancelled")]
    UserCancel,
    #[error("only the session host may perform this operation")]
    NotHost,
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e.to_string())
    }
}

impl SessionError {
    /// DWORD carried in FAIL / ACK records for this error.
    pub fn wire_code(&self) -> u32 {
        match self {
            SessionError::Rejected(code) => *code,
            SessionError::ConnectionLost => ERR_CONNECTION_LOST,
            SessionError::UserCancel => ERR_USER_CANCEL,
            _ => ERR_GENERIC,
        }
    }

    /// Inverse of [`wire_code`]: lift a wire code received from a
    /// remote back into the API taxonomy.
    pub fn from_wire_code(code: u32) -> Result<(), SessionError> {
        match code {
            RESULT_OK => Ok(()),
            ERR_CONNECTION_LOST => Err(SessionError::ConnectionLost),
            ERR_USER_CANCEL => Err(SessionError::UserCancel),
            other => Err(SessionError::Rejected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_code_round_trip() {
        assert_eq!(SessionError::from_wire_code(RESULT_OK), Ok(()));
        assert_eq!(
            SessionError::from_wire_code(ERR_CONNECTION_LOST),
            Err(SessionError::ConnectionLost)
        );
        assert_eq!(
            SessionError::from_wire_code(ERR_SESSION_FULL),
            Err(SessionError::Rejected(ERR_SESSION_FULL))
        );
        assert_eq!(
            SessionError::Rejected(ERR_INVALID_PASSWORD).wire_code(),
            ERR_INVALID_PASSWORD
        );
    }
}
